use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ArchiveError;

/// Identifier of an ecocert: `{chainId}-{contractAddress}-{tokenId}`.
///
/// `full_id` is always the exact string the identifier was parsed from, which
/// is also what `Display` prints and what the record store keys rows on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EcocertId {
    pub chain_id: String,
    pub contract_address: String,
    pub token_id: String,
    pub full_id: String,
}

fn is_contract_address(segment: &str) -> bool {
    segment.strip_prefix("0x").is_some_and(|hex| {
        hex.len() == 40 && hex.bytes().all(|b| b.is_ascii_hexdigit())
    })
}

fn is_numeric(segment: &str) -> bool {
    !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit())
}

impl EcocertId {
    /// Parse a raw identifier.
    ///
    /// # Errors
    /// Returns an `INVALID_IDENTIFIER` validation error unless the input is
    /// exactly three dash-separated segments: a numeric chain id, a `0x`
    /// address with 40 hex digits and a numeric token id.
    pub fn parse(raw: &str) -> Result<Self, ArchiveError> {
        let segments: Vec<&str> = raw.split('-').collect();
        let [chain_id, contract_address, token_id] = segments.as_slice() else {
            return Err(ArchiveError::invalid_identifier(format!(
                "expected chainId-contractAddress-tokenId, got {} segment(s)",
                segments.len()
            ))
            .with_context("input", raw));
        };

        if !is_numeric(chain_id) {
            return Err(ArchiveError::invalid_identifier(format!(
                "chain id '{chain_id}' is not numeric"
            ))
            .with_context("input", raw));
        }
        if !is_contract_address(contract_address) {
            return Err(ArchiveError::invalid_identifier(format!(
                "contract address '{contract_address}' is not 0x followed by 40 hex digits"
            ))
            .with_context("input", raw));
        }
        if !is_numeric(token_id) {
            return Err(ArchiveError::invalid_identifier(format!(
                "token id '{token_id}' is not numeric"
            ))
            .with_context("input", raw));
        }

        Ok(Self {
            chain_id: (*chain_id).to_string(),
            contract_address: (*contract_address).to_string(),
            token_id: (*token_id).to_string(),
            full_id: raw.to_string(),
        })
    }

    /// Rebuild the canonical `chain-address-token` form from the parts.
    #[must_use]
    pub fn compose(&self) -> String {
        format!("{}-{}-{}", self.chain_id, self.contract_address, self.token_id)
    }
}

impl FromStr for EcocertId {
    type Err = ArchiveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Display for EcocertId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.full_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = "42220-0x16bA53B74c234C870c61EFC04cD418B8f2865959-123456789";

    #[test]
    fn parses_well_formed_identifier() -> Result<(), ArchiveError> {
        let id = EcocertId::parse(VALID)?;
        assert_eq!(id.chain_id, "42220");
        assert_eq!(id.contract_address, "0x16bA53B74c234C870c61EFC04cD418B8f2865959");
        assert_eq!(id.token_id, "123456789");
        assert_eq!(id.full_id, VALID);
        assert_eq!(id.compose(), VALID);
        assert_eq!(id.to_string(), VALID);
        Ok(())
    }

    #[test]
    fn rejects_wrong_segment_count() {
        for raw in [
            "",
            "42220",
            "42220-0x16bA53B74c234C870c61EFC04cD418B8f2865959",
            "42220-0x16bA53B74c234C870c61EFC04cD418B8f2865959-1-2",
        ] {
            let code = EcocertId::parse(raw).err().map(|e| e.code);
            assert_eq!(code.as_deref(), Some("INVALID_IDENTIFIER"), "{raw}");
        }
    }

    #[test]
    fn rejects_non_numeric_chain_and_token() {
        assert!(EcocertId::parse("celo-0x16bA53B74c234C870c61EFC04cD418B8f2865959-1").is_err());
        assert!(EcocertId::parse("42220-0x16bA53B74c234C870c61EFC04cD418B8f2865959-abc").is_err());
        assert!(EcocertId::parse("-0x16bA53B74c234C870c61EFC04cD418B8f2865959-1").is_err());
    }

    #[test]
    fn rejects_malformed_addresses() {
        // 39 hex digits
        assert!(EcocertId::parse("42220-0x16bA53B74c234C870c61EFC04cD418B8f286595-1").is_err());
        // missing prefix
        assert!(EcocertId::parse("42220-16bA53B74c234C870c61EFC04cD418B8f2865959aa-1").is_err());
        // non-hex digit
        assert!(EcocertId::parse("42220-0x16bA53B74c234C870c61EFC04cD418B8f286595g-1").is_err());
    }

    #[test]
    fn parse_errors_are_not_retryable() {
        let err = EcocertId::parse("nope").err();
        assert_eq!(err.map(|e| e.retryable), Some(false));
    }
}
