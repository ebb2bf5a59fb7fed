//! CivilView-style county sheriff sale scraper.
//!
//! Sheriff sites present one HTML table per county whose column order
//! shifts between deployments, so columns are discovered from the header
//! row at parse time rather than addressed by index.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::future::join_all;
use scraper::{Html, Selector};
use tracing::{debug, warn};

use njff_core::model::{RawListing, SourceType};
use njff_storage::http::HttpFetcher;

use crate::{
    split_case_title, AdapterError, SearchParams, SourceAdapter, DETAIL_BATCH_DELAY,
    DETAIL_BATCH_SIZE, DETAIL_PAGE_TIMEOUT, LIST_PAGE_TIMEOUT,
};

pub struct CivilViewAdapter {
    id: String,
    label: String,
    state: String,
    endpoint: String,
}

/// Which canonical field a discovered column feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Column {
    Address,
    Status,
    SaleDate,
    OpeningBid,
    Judgment,
    CaseTitle,
    Plaintiff,
    Defendant,
    DetailLink,
}

fn classify_header(text: &str) -> Option<Column> {
    let text = text.trim().to_lowercase();
    if text.contains("address") {
        Some(Column::Address)
    } else if text.contains("status") {
        Some(Column::Status)
    } else if text.contains("date") {
        Some(Column::SaleDate)
    } else if text.contains("upset") || text.contains("opening") || text.contains("bid") {
        Some(Column::OpeningBid)
    } else if text.contains("judgment") {
        Some(Column::Judgment)
    } else if text.contains("plaintiff") {
        Some(Column::Plaintiff)
    } else if text.contains("case title") || text.contains("caption") {
        Some(Column::CaseTitle)
    } else if text.contains("defendant") {
        Some(Column::Defendant)
    } else if text.contains("detail") {
        Some(Column::DetailLink)
    } else {
        None
    }
}

fn sel(source: &str) -> Option<Selector> {
    Selector::parse(source).ok()
}

fn cell_text(cell: &scraper::ElementRef<'_>) -> String {
    cell.text().collect::<Vec<_>>().join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
}

fn cell_link(cell: &scraper::ElementRef<'_>) -> Option<String> {
    let anchor = sel("a")?;
    cell.select(&anchor)
        .next()
        .and_then(|a| a.value().attr("href"))
        .map(str::to_string)
}

impl CivilViewAdapter {
    pub fn new(id: String, label: String, state: String, endpoint: String) -> Self {
        Self {
            id,
            label,
            state,
            endpoint,
        }
    }

    fn list_url(&self, params: &SearchParams) -> String {
        let mut url = self.endpoint.clone();
        if let Some(city) = &params.city {
            let sep = if url.contains('?') { '&' } else { '?' };
            url.push(sep);
            url.push_str("city=");
            url.push_str(&city.replace(' ', "+"));
        }
        url
    }

    /// Parse the sales table into raw rows. Per-row failures are logged and
    /// skipped; anything unrecognizable yields an empty batch.
    fn parse_list_page(&self, html: &str) -> Vec<RawListing> {
        let document = Html::parse_document(html);
        let (Some(table_sel), Some(row_sel), Some(cell_sel), Some(header_sel)) =
            (sel("table"), sel("tr"), sel("td"), sel("th, td"))
        else {
            return Vec::new();
        };

        for table in document.select(&table_sel) {
            let mut rows = table.select(&row_sel);
            let Some(header_row) = rows.next() else {
                continue;
            };
            let mut columns: Vec<Option<Column>> = Vec::new();
            for cell in header_row.select(&header_sel) {
                columns.push(classify_header(&cell_text(&cell)));
            }
            if !columns.contains(&Some(Column::Address)) {
                continue;
            }

            let mut listings = Vec::new();
            for row in rows {
                match self.parse_row(&columns, &row, &cell_sel) {
                    Some(listing) => listings.push(listing),
                    None => {
                        debug!(adapter = %self.id, "skipping unparseable sales row");
                    }
                }
            }
            return listings;
        }

        warn!(adapter = %self.id, "no sales table found on list page");
        Vec::new()
    }

    fn parse_row(
        &self,
        columns: &[Option<Column>],
        row: &scraper::ElementRef<'_>,
        cell_sel: &Selector,
    ) -> Option<RawListing> {
        let mut listing = RawListing {
            stage_hint: Some("Sheriff Sale".to_string()),
            source_name: self.id.clone(),
            source_type: SourceType::Scraper,
            ..RawListing::default()
        };
        let mut case_title = None;

        for (i, cell) in row.select(cell_sel).enumerate() {
            let Some(Some(column)) = columns.get(i) else {
                continue;
            };
            let text = cell_text(&cell);
            match column {
                Column::Address => listing.address = text,
                Column::Status => listing.status = Some(text),
                Column::SaleDate => listing.sale_date_text = Some(text),
                Column::OpeningBid => listing.opening_bid_text = Some(text),
                Column::Judgment => listing.judgment_amount_text = Some(text),
                Column::Plaintiff => listing.plaintiff = Some(text),
                Column::Defendant => listing.defendant = Some(text),
                Column::CaseTitle => case_title = Some(text),
                Column::DetailLink => listing.detail_url = cell_link(&cell),
            }
        }

        if listing.address.trim().is_empty() {
            return None;
        }

        if let Some(title) = case_title {
            let (plaintiff, defendant) = split_case_title(&title);
            if listing.plaintiff.is_none() {
                listing.plaintiff = plaintiff;
            }
            if listing.defendant.is_none() {
                listing.defendant = defendant;
            }
            listing.case_title = Some(title);
        }

        Some(listing)
    }

    /// Label/value pairs from a detail page's two-column table.
    fn parse_detail_page(html: &str) -> BTreeMap<String, String> {
        let document = Html::parse_document(html);
        let mut fields = BTreeMap::new();
        let (Some(row_sel), Some(cell_sel)) = (sel("tr"), sel("th, td")) else {
            return fields;
        };
        for row in document.select(&row_sel) {
            let cells: Vec<String> = row.select(&cell_sel).map(|c| cell_text(&c)).collect();
            if cells.len() == 2 && !cells[0].is_empty() {
                fields.insert(cells[0].trim_end_matches(':').to_lowercase(), cells[1].clone());
            }
        }
        fields
    }

    fn apply_detail_fields(listing: &mut RawListing, fields: BTreeMap<String, String>) {
        for (label, value) in fields {
            if value.trim().is_empty() {
                continue;
            }
            match label.as_str() {
                "plaintiff" => listing.plaintiff.get_or_insert(value),
                "defendant" => listing.defendant.get_or_insert(value),
                "approx. upset" | "upset amount" | "opening bid" => {
                    listing.opening_bid_text.get_or_insert(value)
                }
                "approx. judgment" | "judgment amount" => {
                    listing.judgment_amount_text.get_or_insert(value)
                }
                "status" => listing.status.get_or_insert(value),
                "attorney phone" | "phone" => listing.owner_phone.get_or_insert(value),
                _ => {
                    listing.debug.entry(label).or_insert(value);
                    continue;
                }
            };
        }
    }

    /// Fetch and merge one detail page; failures leave the row as parsed.
    async fn enrich_row(&self, http: &HttpFetcher, mut listing: RawListing) -> RawListing {
        let Some(url) = listing.detail_url.clone() else {
            return listing;
        };
        match http.fetch_bytes(&self.id, &url, DETAIL_PAGE_TIMEOUT).await {
            Ok(page) => {
                let fields = Self::parse_detail_page(&page.text());
                Self::apply_detail_fields(&mut listing, fields);
            }
            Err(err) => {
                warn!(adapter = %self.id, %url, error = %err, "detail fetch failed; keeping list row");
            }
        }
        listing
    }
}

#[async_trait]
impl SourceAdapter for CivilViewAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn source_type(&self) -> SourceType {
        SourceType::Scraper
    }

    fn supports_state(&self, code: &str) -> bool {
        self.state.eq_ignore_ascii_case(code)
    }

    async fn search(
        &self,
        http: &HttpFetcher,
        params: &SearchParams,
    ) -> Result<Vec<RawListing>, AdapterError> {
        if !self.supports_state(&params.state) {
            return Err(AdapterError::UnsupportedState(params.state.clone()));
        }

        let url = self.list_url(params);
        let page = match http.fetch_bytes(&self.id, &url, LIST_PAGE_TIMEOUT).await {
            Ok(page) => page,
            Err(err) if err.is_rate_limit() => {
                return Err(AdapterError::RateLimited(err.to_string()));
            }
            Err(err) => {
                warn!(adapter = %self.id, error = %err, "list page fetch failed; returning empty batch");
                return Ok(Vec::new());
            }
        };

        let rows = self.parse_list_page(&page.text());

        // Detail enrichment in bounded batches with an inter-batch delay,
        // each item isolated from its neighbors' failures.
        let mut enriched = Vec::with_capacity(rows.len());
        let mut batches = rows.chunks(DETAIL_BATCH_SIZE).peekable();
        while let Some(batch) = batches.next() {
            let results =
                join_all(batch.iter().map(|row| self.enrich_row(http, row.clone()))).await;
            enriched.extend(results);
            if batches.peek().is_some() {
                tokio::time::sleep(DETAIL_BATCH_DELAY).await;
            }
        }

        Ok(enriched)
    }
}
