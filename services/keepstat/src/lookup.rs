//! Geographic lookups: country and NUTS centroids, NUTS labels
//!
//! Every lookup is best-effort: a code without a reference entry resolves to
//! `None` and never raises.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use tokio::fs;

use crate::error::{EtlError, Result};

/// A latitude/longitude pair
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Centroid {
    pub lat: f64,
    pub lng: f64,
}

/// Legacy EU country codes that differ from ISO 3166 alpha-2
const CCA2_ALIASES: &[(&str, &str)] = &[("UK", "GB"), ("EL", "GR")];

/// Map a NUTS-0 code onto the ISO alpha-2 code used by the country table
pub fn cca2_alias(code: &str) -> &str {
    CCA2_ALIASES
        .iter()
        .find(|(legacy, _)| *legacy == code)
        .map_or(code, |(_, iso)| *iso)
}

/// `"[<code>] - <Label>"`, description lower-cased then capitalized
pub fn nuts_label(code: &str, description: &str) -> String {
    format!("[{}] - {}", code, capitalize(description))
}

/// Lowercases the whole string first so a word-final `Σ` becomes `ς`
fn capitalize(text: &str) -> String {
    let lower = text.to_lowercase();
    let mut chars = lower.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// The four NUTS nesting levels, coarse to fine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NutsLevel {
    Country,
    Region1,
    Region2,
    Region3,
}

impl NutsLevel {
    /// Leading characters of a code that identify a region at this level.
    /// Level 3 uses the whole code.
    pub fn significant_chars(self) -> Option<usize> {
        match self {
            NutsLevel::Country => Some(2),
            NutsLevel::Region1 => Some(3),
            NutsLevel::Region2 => Some(4),
            NutsLevel::Region3 => None,
        }
    }
}

// =============================================================================
// Country centroids
// =============================================================================

#[derive(Debug, Deserialize)]
struct CountryRecord {
    cca2: String,
    lat: f64,
    lng: f64,
}

#[derive(Debug, Default, Clone)]
pub struct CountryCentroids {
    by_cca2: HashMap<String, Centroid>,
}

impl CountryCentroids {
    /// Parse a JSON array of `{"cca2", "lat", "lng", ...}` objects
    pub fn from_json(content: &str, origin: &str) -> Result<Self> {
        let records: Vec<CountryRecord> =
            serde_json::from_str(content).map_err(|e| EtlError::ReferenceData {
                path: origin.to_string(),
                detail: e.to_string(),
            })?;
        Ok(records
            .into_iter()
            .map(|r| (r.cca2, Centroid { lat: r.lat, lng: r.lng }))
            .collect())
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let content = read_reference(path).await?;
        Self::from_json(&content, &path.display().to_string())
    }

    /// Centroid for a country code; `UK` and `EL` are accepted
    pub fn centroid(&self, code: &str) -> Option<Centroid> {
        self.by_cca2.get(cca2_alias(code)).copied()
    }

    pub fn len(&self) -> usize {
        self.by_cca2.len()
    }
}

impl FromIterator<(String, Centroid)> for CountryCentroids {
    fn from_iter<T: IntoIterator<Item = (String, Centroid)>>(iter: T) -> Self {
        Self {
            by_cca2: iter.into_iter().collect(),
        }
    }
}

// =============================================================================
// NUTS centroids
// =============================================================================

#[derive(Debug, Deserialize)]
struct NutsCoordRecord {
    #[serde(rename = "NUTS_code")]
    code: String,
    lat: Option<f64>,
    lng: Option<f64>,
}

#[derive(Debug, Default, Clone)]
pub struct NutsCentroids {
    by_code: HashMap<String, Centroid>,
}

impl NutsCentroids {
    /// Parse a CSV with at least the `NUTS_code`, `lat` and `lng` columns.
    /// Rows with a missing coordinate are skipped.
    pub fn from_csv(content: &str, origin: &str) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(content.as_bytes());

        let mut by_code = HashMap::new();
        for (line_idx, result) in reader.deserialize::<NutsCoordRecord>().enumerate() {
            let record = result.map_err(|e| EtlError::ReferenceData {
                path: origin.to_string(),
                detail: format!("line {}: {}", line_idx + 2, e),
            })?;
            if let (Some(lat), Some(lng)) = (record.lat, record.lng) {
                by_code.insert(record.code, Centroid { lat, lng });
            }
        }
        Ok(Self { by_code })
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let content = read_reference(path).await?;
        Self::from_csv(&content, &path.display().to_string())
    }

    /// Centroid of the region that `code` belongs to at `level`.
    /// A code shorter than the level's prefix has no region there.
    pub fn centroid(&self, code: &str, level: NutsLevel) -> Option<Centroid> {
        let key = match level.significant_chars() {
            Some(n) => {
                if code.chars().count() < n {
                    return None;
                }
                code.chars().take(n).collect::<String>()
            }
            None => code.to_string(),
        };
        self.by_code.get(&key).copied()
    }

    pub fn len(&self) -> usize {
        self.by_code.len()
    }
}

impl FromIterator<(String, Centroid)> for NutsCentroids {
    fn from_iter<T: IntoIterator<Item = (String, Centroid)>>(iter: T) -> Self {
        Self {
            by_code: iter.into_iter().collect(),
        }
    }
}

// =============================================================================
// NUTS descriptions (from the source store)
// =============================================================================

#[derive(Debug, Default, Clone)]
pub struct NutsLabels {
    by_code: HashMap<String, String>,
}

impl NutsLabels {
    pub fn label(&self, code: &str) -> Option<String> {
        self.by_code
            .get(code)
            .map(|description| nuts_label(code, description))
    }
}

impl FromIterator<(String, String)> for NutsLabels {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self {
            by_code: iter.into_iter().collect(),
        }
    }
}

/// Injected static reference tables for one run
#[derive(Debug, Default, Clone)]
pub struct ReferenceData {
    pub countries: CountryCentroids,
    pub nuts: NutsCentroids,
}

impl ReferenceData {
    pub async fn load(countries_path: &Path, nuts_coord_path: &Path) -> Result<Self> {
        Ok(Self {
            countries: CountryCentroids::load(countries_path).await?,
            nuts: NutsCentroids::load(nuts_coord_path).await?,
        })
    }
}

async fn read_reference(path: &Path) -> Result<String> {
    let content = fs::read_to_string(path)
        .await
        .map_err(|e| EtlError::ReferenceData {
            path: path.display().to_string(),
            detail: e.to_string(),
        })?;
    // Strip UTF-8 BOM if present
    Ok(content.trim_start_matches('\u{feff}').to_string())
}
