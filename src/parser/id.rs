use std::fmt;

use super::ParseError;

/// A relay identity: the 40-character uppercase hex fingerprint used as the
/// join key across all data sources.
///
/// Scanner and vote files carry the fingerprint with a leading `$` on the
/// wire; the consensus encodes it in base64. Both forms normalize to the bare
/// hex digits.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelayId(String);

impl RelayId {
    pub fn from_wire(raw: &str) -> RelayId {
        RelayId(raw.strip_prefix('$').unwrap_or(raw).to_string())
    }

    pub fn from_b64(raw_b64: &str) -> Result<RelayId, ParseError> {
        // consensus identities come unpadded
        let mut padded = raw_b64.to_string();
        while padded.len() % 4 != 0 {
            padded.push('=');
        }
        let blob = base64::decode(&padded)?;

        use std::fmt::Write;
        let mut hex = String::with_capacity(blob.len() * 2);
        for byte in &blob {
            write!(&mut hex, "{:02X}", byte).unwrap();
        }
        Ok(RelayId(hex))
    }

    pub fn as_hex(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RelayId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "${}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_prefix_stripped() {
        let id = RelayId::from_wire("$AB01CD");
        assert_eq!(id.as_hex(), "AB01CD");
        assert_eq!(id.to_string(), "$AB01CD");
        assert_eq!(id, RelayId::from_wire("AB01CD"));
    }

    #[test]
    fn test_b64_identity() {
        // 20 bytes of 0x41, unpadded as in a consensus "r" line
        let id = RelayId::from_b64("QUFBQUFBQUFBQUFBQUFBQUFBQUE").unwrap();
        assert_eq!(id.as_hex(), "41".repeat(20));
    }

    #[test]
    fn test_b64_invalid() {
        assert!(RelayId::from_b64("not!base64?").is_err());
    }
}
