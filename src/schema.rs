//! Resolves field names to the element ids of the target installation.

use crate::client::{ApiClient, TransportError};
use crate::config::{ELEMENTS_PER_PAGE, REQUIRED_FIELD};
use crate::events::EventSink;
use crate::models::{ElementRecord, FieldMapping, MappingSource};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("element listing returned HTTP {0}")]
    Status(u16),

    #[error("element listing is not a JSON array of elements: {0}")]
    Malformed(String),

    #[error("element listing contains no usable elements")]
    Empty,
}

/// What to do when the live element listing cannot be read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchemaPolicy {
    /// Substitute the built-in table and flag the mapping as unverified
    #[default]
    Fallback,
    /// Fail; nothing is uploaded
    Strict,
}

/// Builds a mapping from listing entries. Entries without a name or id are
/// skipped; a repeated name keeps the last id seen.
pub fn mapping_from_elements(records: &[ElementRecord]) -> FieldMapping {
    let mut mapping = FieldMapping::new(MappingSource::Remote);
    for record in records {
        let name = record.name.as_deref().unwrap_or_default();
        match record.id {
            Some(id) if id != 0 && !name.is_empty() => mapping.insert(name, id),
            _ => {}
        }
    }
    mapping
}

/// One read of the element listing, no fallback.
pub async fn fetch_mapping(client: &ApiClient) -> Result<FieldMapping, SchemaError> {
    let per_page = ELEMENTS_PER_PAGE.to_string();
    let response = client
        .get("elements", &[("per_page", per_page.as_str())])
        .await?;

    if response.status != 200 {
        return Err(SchemaError::Status(response.status));
    }

    let records: Vec<ElementRecord> =
        serde_json::from_str(&response.body).map_err(|e| SchemaError::Malformed(e.to_string()))?;

    Ok(mapping_from_elements(&records))
}

/// Fetches the mapping and applies `policy` on failure, reporting progress
/// to `sink`. A listing with no usable entries counts as a failure. A
/// missing Title is a warning only.
pub async fn resolve(
    client: &ApiClient,
    policy: SchemaPolicy,
    sink: &EventSink,
) -> Result<FieldMapping, SchemaError> {
    sink.emit("Fetching element ids from API...");

    let fetched = fetch_mapping(client).await.and_then(|mapping| {
        if mapping.is_empty() {
            Err(SchemaError::Empty)
        } else {
            Ok(mapping)
        }
    });

    let mapping = match fetched {
        Ok(mapping) => {
            info!(elements = mapping.len(), "Element mapping resolved");
            sink.emit(format!("Mapped {} element ids", mapping.len()));
            mapping
        }
        Err(e) if policy == SchemaPolicy::Fallback => {
            warn!(error = %e, "Element listing unavailable, using fallback table");
            sink.emit(format!("Failed to fetch elements: {e}"));
            sink.emit("Using default element ids (unverified, may not match this install)");
            FieldMapping::fallback()
        }
        Err(e) => {
            sink.emit(format!("Failed to fetch elements: {e}"));
            return Err(e);
        }
    };

    if !mapping.contains(REQUIRED_FIELD) {
        warn!(field = REQUIRED_FIELD, "Required element missing from mapping");
        sink.emit(format!(
            "Warning: '{REQUIRED_FIELD}' element not found in API response"
        ));
    }

    Ok(mapping)
}
