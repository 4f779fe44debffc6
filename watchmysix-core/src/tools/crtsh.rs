//! Certificate transparency lookups against crt.sh.

use std::collections::BTreeSet;

use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct CertificateRecord {
    #[serde(default)]
    name_value: Option<String>,
}

/// Query `endpoint` for certificates issued under `target` and return the
/// distinct names they cover, sorted.
pub async fn fetch_names(
    client: &reqwest::Client,
    endpoint: &str,
    target: &str,
) -> reqwest::Result<(usize, Vec<String>)> {
    let records: Vec<CertificateRecord> = client
        .get(endpoint)
        .query(&[("q", target), ("output", "json")])
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    Ok((records.len(), collect_names(&records)))
}

fn collect_names(records: &[CertificateRecord]) -> Vec<String> {
    records
        .iter()
        .filter_map(|record| record.name_value.as_deref())
        .flat_map(str::lines)
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_ascii_lowercase)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_multi_name_records_and_dedupes() {
        let records: Vec<CertificateRecord> = serde_json::from_str(
            r#"[
                {"name_value": "www.example.com\nexample.com"},
                {"name_value": "*.example.com"},
                {"name_value": "WWW.example.com "},
                {"issuer_name": "no names here"}
            ]"#,
        )
        .unwrap();

        assert_eq!(
            collect_names(&records),
            vec!["*.example.com", "example.com", "www.example.com"]
        );
    }
}
