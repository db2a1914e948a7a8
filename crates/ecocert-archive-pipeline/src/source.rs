//! Upstream attestation source.

use std::collections::BTreeMap;
use std::future::Future;

use ecocert_archive_core::{ArchiveError, EcocertId, SourceAttestation};
use serde_json::json;

/// Where identifiers and their attestations come from
pub trait AttestationSource: Send + Sync {
    fn attestations_for(
        &self,
        identifier: &EcocertId,
    ) -> impl Future<Output = Result<Vec<SourceAttestation>, ArchiveError>> + Send;

    /// Every identifier the source can currently report on.
    fn known_identifiers(&self) -> impl Future<Output = Result<Vec<String>, ArchiveError>> + Send;
}

/// In-memory source keyed by full identifier
#[derive(Debug, Clone, Default)]
pub struct MockAttestationSource {
    attestations: BTreeMap<String, Vec<SourceAttestation>>,
    unavailable: bool,
}

const SAMPLE_CONTRACT: &str = "0x16bA53B74c234C870c61EFC04cD418B8f2865959";
const SAMPLE_ATTESTER: &str = "0x7a2F8e0A9C3b5D4e6F1a2B3c4D5e6F7a8B9c0D1e";
const SAMPLE_REPORT: &str = "https://example.org/reports/reforestation-q1.pdf";
const SAMPLE_AUDIT: &str = "https://verifier.example.net/audits/2024/ecocert-123456789";
const SAMPLE_CID: &str = "bafybeigdyrzt5sfp7udm7hu76uh7y26nf3efuylqabf3oclgtqy55fbzdi";
const SAMPLE_FIELD_NOTES: &str = "https://example.org/field-notes/mangroves.csv";
const SAMPLE_ARWEAVE: &str = "ar://bNbA3TEQVL60xlgCcqdz4ZPHFZ711cZ3hmkpGttDt_U";

impl MockAttestationSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_attestations(
        mut self,
        identifier: impl Into<String>,
        attestations: Vec<SourceAttestation>,
    ) -> Self {
        self.attestations
            .entry(identifier.into())
            .or_default()
            .extend(attestations);
        self
    }

    /// Every call fails with `SOURCE_UNAVAILABLE`.
    #[must_use]
    pub fn unavailable(mut self) -> Self {
        self.unavailable = true;
        self
    }

    /// Sample identifiers used by `process-all`.
    #[must_use]
    pub fn sample() -> Self {
        let reforestation = format!("42220-{SAMPLE_CONTRACT}-123456789");
        let mangroves = format!("42220-{SAMPLE_CONTRACT}-987654321");
        let soil = format!("10-{SAMPLE_CONTRACT}-555");

        Self::new()
            .with_attestations(
                reforestation.clone(),
                vec![
                    sample_attestation(
                        &reforestation,
                        1,
                        json!({
                            "title": "Reforestation progress report Q1",
                            "description": "Planting survey and drone imagery",
                            "sources": [
                                { "type": "url", "src": SAMPLE_REPORT },
                                { "type": "url", "src": "https://example.org/imagery/plot-7.jpg" },
                                { "type": "ipfs", "src": SAMPLE_CID }
                            ]
                        }),
                    ),
                    sample_attestation(
                        &reforestation,
                        2,
                        json!({
                            "title": "Independent verification",
                            "sources": [
                                { "type": "url", "src": SAMPLE_REPORT },
                                { "type": "url", "src": SAMPLE_AUDIT }
                            ]
                        }),
                    ),
                ],
            )
            .with_attestations(
                mangroves.clone(),
                vec![sample_attestation(
                    &mangroves,
                    1,
                    json!({
                        "title": "Mangrove restoration field notes",
                        "sources": [
                            { "type": "url", "src": SAMPLE_FIELD_NOTES },
                            { "type": "arweave", "src": SAMPLE_ARWEAVE }
                        ]
                    }),
                )],
            )
            .with_attestations(soil, Vec::new())
    }
}

fn sample_attestation(
    identifier: &str,
    index: usize,
    payload: serde_json::Value,
) -> SourceAttestation {
    let day = i64::try_from(index).unwrap_or_default();
    SourceAttestation {
        uid: format!("{identifier}-attestation-{index}"),
        attester: SAMPLE_ATTESTER.to_string(),
        creation_timestamp: Some(1_704_067_200 + day * 86_400),
        payload,
    }
}

impl AttestationSource for MockAttestationSource {
    async fn attestations_for(
        &self,
        identifier: &EcocertId,
    ) -> Result<Vec<SourceAttestation>, ArchiveError> {
        if self.unavailable {
            return Err(ArchiveError::source_unavailable(
                "mock source marked unavailable",
            ));
        }
        Ok(self
            .attestations
            .get(&identifier.full_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn known_identifiers(&self) -> Result<Vec<String>, ArchiveError> {
        if self.unavailable {
            return Err(ArchiveError::source_unavailable(
                "mock source marked unavailable",
            ));
        }
        Ok(self.attestations.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use ecocert_archive_core::{extract_urls, AttestationPayload};

    use super::*;

    #[tokio::test]
    async fn sample_identifiers_are_well_formed() -> Result<(), ArchiveError> {
        let source = MockAttestationSource::sample();
        let ids = source.known_identifiers().await?;
        assert_eq!(ids.len(), 3);
        for raw in &ids {
            let id = EcocertId::parse(raw)?;
            for attestation in source.attestations_for(&id).await? {
                AttestationPayload::from_value(&attestation.payload)?;
            }
        }
        Ok(())
    }

    #[tokio::test]
    async fn sample_urls_are_deduplicated_across_attestations() -> Result<(), ArchiveError> {
        let source = MockAttestationSource::sample();
        let id = EcocertId::parse(&format!("42220-{SAMPLE_CONTRACT}-123456789"))?;
        let payloads = source
            .attestations_for(&id)
            .await?
            .iter()
            .map(|a| AttestationPayload::from_value(&a.payload))
            .collect::<Result<Vec<_>, _>>()?;
        assert_eq!(extract_urls(&payloads).len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_identifier_has_no_attestations() -> Result<(), ArchiveError> {
        let id = EcocertId::parse(&format!("1-{SAMPLE_CONTRACT}-1"))?;
        let empty = MockAttestationSource::new();
        assert!(empty.attestations_for(&id).await?.is_empty());

        let down = MockAttestationSource::new().unavailable();
        let code = down.attestations_for(&id).await.err().map(|e| e.code);
        assert_eq!(code, Some("SOURCE_UNAVAILABLE".to_string()));
        Ok(())
    }
}
