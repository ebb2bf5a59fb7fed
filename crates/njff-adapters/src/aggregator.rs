//! Private auction-aggregator API adapter.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

use njff_core::model::{RawListing, SourceType};
use njff_storage::http::HttpFetcher;

use crate::{AdapterError, SearchParams, SourceAdapter, LIST_PAGE_TIMEOUT};

pub struct AggregatorAdapter {
    id: String,
    label: String,
    state: String,
    endpoint: String,
}

/// Wire shape of one aggregator listing. Everything optional: the feed
/// omits fields freely and normalization owns the interpretation.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AggregatorRecord {
    address: Option<String>,
    status: Option<String>,
    listing_type: Option<String>,
    auction_date: Option<String>,
    opening_bid: Option<String>,
    estimated_value: Option<String>,
    plaintiff: Option<String>,
    defendant: Option<String>,
    property_type: Option<String>,
    occupancy: Option<String>,
    beds: Option<String>,
    baths: Option<String>,
    lot_sqft: Option<String>,
    detail_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AggregatorPage {
    #[serde(default)]
    listings: Vec<AggregatorRecord>,
}

impl AggregatorAdapter {
    pub fn new(id: String, label: String, state: String, endpoint: String) -> Self {
        Self {
            id,
            label,
            state,
            endpoint,
        }
    }

    fn query_url(&self, params: &SearchParams) -> String {
        let mut url = format!("{}?state={}", self.endpoint, params.state);
        if let Some(city) = &params.city {
            url.push_str("&city=");
            url.push_str(&city.replace(' ', "+"));
        }
        if let Some(max_price) = params.max_price {
            url.push_str(&format!("&maxPrice={max_price}"));
        }
        url
    }

    fn map_record(&self, record: AggregatorRecord) -> Option<RawListing> {
        let address = record.address?;
        if address.trim().is_empty() {
            return None;
        }
        Some(RawListing {
            address,
            status: record.status,
            stage_hint: record.listing_type.or_else(|| Some("Auction".to_string())),
            sale_date_text: record.auction_date,
            opening_bid_text: record.opening_bid,
            est_value_text: record.estimated_value,
            plaintiff: record.plaintiff,
            defendant: record.defendant,
            property_type: record.property_type,
            occupancy: record.occupancy,
            beds_text: record.beds,
            baths_text: record.baths,
            lot_sqft_text: record.lot_sqft,
            detail_url: record.detail_url,
            source_name: self.id.clone(),
            source_type: SourceType::Api,
            ..RawListing::default()
        })
    }

    fn parse_page(&self, body: &[u8]) -> Vec<RawListing> {
        let page: AggregatorPage = match serde_json::from_slice(body) {
            Ok(page) => page,
            Err(err) => {
                warn!(adapter = %self.id, error = %err, "aggregator payload unparseable; returning empty batch");
                return Vec::new();
            }
        };
        page.listings
            .into_iter()
            .filter_map(|record| self.map_record(record))
            .collect()
    }
}

#[async_trait]
impl SourceAdapter for AggregatorAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn source_type(&self) -> SourceType {
        SourceType::Api
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

        let url = self.query_url(params);
        let page = match http.fetch_bytes(&self.id, &url, LIST_PAGE_TIMEOUT).await {
            Ok(page) => page,
            Err(err) if err.is_rate_limit() => {
                return Err(AdapterError::RateLimited(err.to_string()));
            }
            Err(err) => {
                warn!(adapter = %self.id, error = %err, "aggregator fetch failed; returning empty batch");
                return Ok(Vec::new());
            }
        };

        Ok(self.parse_page(&page.body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> AggregatorAdapter {
        AggregatorAdapter::new(
            "auction-aggregator".into(),
            "Private Aggregator".into(),
            "NJ".into(),
            "https://api.example.com/listings".into(),
        )
    }

    #[test]
    fn payload_maps_to_raw_listings() {
        let body = br#"{
            "listings": [
                {
                    "address": "9 Pine St, Newark, NJ 07102",
                    "status": "Active",
                    "listingType": "Online Auction",
                    "auctionDate": "2025-01-10",
                    "openingBid": "$99,000",
                    "estimatedValue": "$240,000",
                    "propertyType": "Single Family",
                    "beds": "3",
                    "baths": "1.5",
                    "detailUrl": "https://api.example.com/listings/9"
                },
                { "address": "", "status": "Active" },
                { "status": "missing address entirely" }
            ]
        }"#;

        let listings = adapter().parse_page(body);
        assert_eq!(listings.len(), 1);
        let listing = &listings[0];
        assert_eq!(listing.address, "9 Pine St, Newark, NJ 07102");
        assert_eq!(listing.stage_hint.as_deref(), Some("Online Auction"));
        assert_eq!(listing.opening_bid_text.as_deref(), Some("$99,000"));
        assert_eq!(listing.beds_text.as_deref(), Some("3"));
        assert_eq!(listing.source_type, SourceType::Api);
    }

    #[test]
    fn missing_listing_type_defaults_to_auction_hint() {
        let body = br#"{"listings": [{"address": "9 Pine St, Newark, NJ 07102"}]}"#;
        let listings = adapter().parse_page(body);
        assert_eq!(listings[0].stage_hint.as_deref(), Some("Auction"));
    }

    #[test]
    fn garbage_payload_is_an_empty_batch() {
        assert!(adapter().parse_page(b"<html>503</html>").is_empty());
        assert!(adapter().parse_page(b"{}").is_empty());
    }

    #[test]
    fn query_url_carries_state_city_and_price() {
        let params = SearchParams {
            state: "NJ".into(),
            city: Some("Jersey City".into()),
            max_price: Some(400000.0),
            ..SearchParams::default()
        };
        let url = adapter().query_url(&params);
        assert!(url.contains("state=NJ"));
        assert!(url.contains("city=Jersey+City"));
        assert!(url.contains("maxPrice=400000"));
    }
}
