//! Manual CSV import adapter.
//!
//! Operators upload spreadsheets exported from county lists; headers are
//! discovered by name so column order never matters. The cell reader
//! understands quoted cells, doubled quotes, and embedded commas/newlines.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{debug, warn};

use njff_core::model::{RawListing, SourceType};
use njff_storage::http::HttpFetcher;

use crate::{split_case_title, AdapterError, SearchParams, SourceAdapter};

pub struct ManualCsvAdapter {
    id: String,
    label: String,
    state: String,
    path: PathBuf,
}

/// Minimal RFC-4180 reader: quoted cells, `""` escapes, CR/LF rows.
pub fn parse_csv(text: &str) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    let mut row = Vec::new();
    let mut cell = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' => {
                    if chars.peek() == Some(&'"') {
                        chars.next();
                        cell.push('"');
                    } else {
                        in_quotes = false;
                    }
                }
                _ => cell.push(c),
            }
            continue;
        }
        match c {
            '"' => in_quotes = true,
            ',' => {
                row.push(std::mem::take(&mut cell));
            }
            '\r' => {}
            '\n' => {
                row.push(std::mem::take(&mut cell));
                if row.iter().any(|c| !c.trim().is_empty()) {
                    rows.push(std::mem::take(&mut row));
                } else {
                    row.clear();
                }
            }
            _ => cell.push(c),
        }
    }
    if !cell.is_empty() || !row.is_empty() {
        row.push(cell);
        if row.iter().any(|c| !c.trim().is_empty()) {
            rows.push(row);
        }
    }
    rows
}

#[derive(Debug, Default, Clone, Copy)]
struct HeaderMap {
    address: Option<usize>,
    status: Option<usize>,
    stage: Option<usize>,
    sale_date: Option<usize>,
    opening_bid: Option<usize>,
    est_value: Option<usize>,
    plaintiff: Option<usize>,
    defendant: Option<usize>,
    case_title: Option<usize>,
    phone: Option<usize>,
    occupancy: Option<usize>,
    property_type: Option<usize>,
}

fn discover_headers(header_row: &[String]) -> HeaderMap {
    let mut map = HeaderMap::default();
    for (i, cell) in header_row.iter().enumerate() {
        let name = cell.trim().to_lowercase();
        let slot = if name.contains("address") {
            &mut map.address
        } else if name.contains("stage") {
            &mut map.stage
        } else if name.contains("status") {
            &mut map.status
        } else if name.contains("date") {
            &mut map.sale_date
        } else if name.contains("bid") || name.contains("upset") {
            &mut map.opening_bid
        } else if name.contains("value") || name.contains("estimate") {
            &mut map.est_value
        } else if name.contains("plaintiff") {
            &mut map.plaintiff
        } else if name.contains("case") {
            &mut map.case_title
        } else if name.contains("defendant") || name.contains("owner") {
            &mut map.defendant
        } else if name.contains("phone") {
            &mut map.phone
        } else if name.contains("occupancy") {
            &mut map.occupancy
        } else if name.contains("type") {
            &mut map.property_type
        } else {
            continue;
        };
        slot.get_or_insert(i);
    }
    map
}

fn cell(row: &[String], index: Option<usize>) -> Option<String> {
    let value = row.get(index?)?.trim();
    (!value.is_empty()).then(|| value.to_string())
}

impl ManualCsvAdapter {
    pub fn new(id: String, label: String, state: String, path: impl Into<PathBuf>) -> Self {
        Self {
            id,
            label,
            state,
            path: path.into(),
        }
    }

    fn map_rows(&self, rows: Vec<Vec<String>>) -> Vec<RawListing> {
        let Some((header, data)) = rows.split_first() else {
            return Vec::new();
        };
        let map = discover_headers(header);
        if map.address.is_none() {
            warn!(adapter = %self.id, "import file has no address column");
            return Vec::new();
        }

        let mut listings = Vec::new();
        for row in data {
            let Some(address) = cell(row, map.address) else {
                debug!(adapter = %self.id, "skipping import row without address");
                continue;
            };
            let mut listing = RawListing {
                address,
                status: cell(row, map.status),
                stage_hint: cell(row, map.stage),
                sale_date_text: cell(row, map.sale_date),
                opening_bid_text: cell(row, map.opening_bid),
                est_value_text: cell(row, map.est_value),
                plaintiff: cell(row, map.plaintiff),
                defendant: cell(row, map.defendant),
                owner_phone: cell(row, map.phone),
                occupancy: cell(row, map.occupancy),
                property_type: cell(row, map.property_type),
                source_name: self.id.clone(),
                source_type: SourceType::Manual,
                ..RawListing::default()
            };
            if let Some(title) = cell(row, map.case_title) {
                let (plaintiff, defendant) = split_case_title(&title);
                if listing.plaintiff.is_none() {
                    listing.plaintiff = plaintiff;
                }
                if listing.defendant.is_none() {
                    listing.defendant = defendant;
                }
                listing.case_title = Some(title);
            }
            listings.push(listing);
        }
        listings
    }
}

#[async_trait]
impl SourceAdapter for ManualCsvAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn source_type(&self) -> SourceType {
        SourceType::Manual
    }

    fn supports_state(&self, code: &str) -> bool {
        self.state.eq_ignore_ascii_case(code)
    }

    async fn search(
        &self,
        _http: &HttpFetcher,
        params: &SearchParams,
    ) -> Result<Vec<RawListing>, AdapterError> {
        if !self.supports_state(&params.state) {
            return Err(AdapterError::UnsupportedState(params.state.clone()));
        }

        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) => {
                warn!(
                    adapter = %self.id,
                    path = %self.path.display(),
                    error = %err,
                    "import file unreadable; returning empty batch"
                );
                return Ok(Vec::new());
            }
        };

        Ok(self.map_rows(parse_csv(&text)))
    }
}
