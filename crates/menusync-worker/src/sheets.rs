// Google Sheets menu source
// Decision: read cell values through the Sheets v4 values API with an API key;
// layout interpretation lives in menusync_core::menu_from_rows

use async_trait::async_trait;
use menusync_core::{menu_from_rows, Menu, MenuSource, TransformError, SHEET_RANGE};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, instrument};

pub const DEFAULT_SHEETS_BASE_URL: &str = "https://sheets.googleapis.com";

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

/// Fetches menus from Google Sheets
pub struct GoogleSheetsMenuSource {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl GoogleSheetsMenuSource {
    pub fn new(api_key: Option<String>) -> Self {
        Self::with_base_url(DEFAULT_SHEETS_BASE_URL, api_key)
    }

    pub fn with_base_url(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }

    async fn fetch_rows(&self, spreadsheet_id: &str) -> Result<Vec<Vec<String>>, TransformError> {
        let api_key = self.api_key.as_deref().ok_or_else(|| {
            TransformError::NotConfigured("GOOGLE_SHEETS_API_KEY is not set".to_string())
        })?;

        let url = format!(
            "{}/v4/spreadsheets/{}/values/{}",
            self.base_url, spreadsheet_id, SHEET_RANGE
        );
        let response = self
            .client
            .get(&url)
            .query(&[("key", api_key)])
            .send()
            .await
            .map_err(|e| TransformError::Fetch(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(TransformError::Fetch(format!(
                "sheets API request failed with status {}: {}",
                status, error_text
            )));
        }

        let range: ValueRange = response
            .json()
            .await
            .map_err(|e| TransformError::InvalidData(e.to_string()))?;

        Ok(range
            .values
            .into_iter()
            .map(|row| row.into_iter().map(cell_text).collect())
            .collect())
    }
}

/// Formatted values arrive as strings; anything else is rendered as JSON text
fn cell_text(cell: Value) -> String {
    match cell {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[async_trait]
impl MenuSource for GoogleSheetsMenuSource {
    #[instrument(skip(self))]
    async fn parse_menu(
        &self,
        spreadsheet_id: &str,
        restaurant_name: &str,
    ) -> Result<Menu, TransformError> {
        let rows = self.fetch_rows(spreadsheet_id).await?;
        debug!(rows = rows.len(), "fetched spreadsheet rows");
        menu_from_rows(&rows, restaurant_name)
            .ok_or_else(|| TransformError::EmptySheet(spreadsheet_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use menusync_core::ProductStatus;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SHEET_PATH: &str = "/v4/spreadsheets/sheet-1/values/A:N";

    #[tokio::test]
    async fn test_parse_menu_from_values() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(SHEET_PATH))
            .and(query_param("key", "test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "range": "Sheet1!A1:N5",
                "majorDimension": "ROWS",
                "values": [
                    ["id", "name", "combo", "price", "description"],
                    ["Burgers"],
                    ["p1", "Classic", "FALSE", "9.5", "Beef patty"],
                    ["", "", "", "", "", "g1", "Sauces", "0", "2", "a1", "Ketchup", "0", "1", "0"],
                    ["p2", "Double", "TRUE", 12]
                ]
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let source =
            GoogleSheetsMenuSource::with_base_url(mock_server.uri(), Some("test-key".to_string()));
        let menu = source.parse_menu("sheet-1", "Burger Hub").await.unwrap();

        assert_eq!(menu.restaurant_id, "burger-hub");
        assert_eq!(menu.products.len(), 2);
        let classic = menu.product("p1").unwrap();
        assert_eq!(classic.category, "Burgers");
        assert_eq!(classic.status, ProductStatus::Available);
        assert_eq!(classic.attributes, vec!["g1"]);
        assert_eq!(menu.product("p2").unwrap().price, 12.0);
        assert_eq!(menu.attribute_groups[0].attributes, vec!["a1"]);
    }

    #[tokio::test]
    async fn test_empty_sheet() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(SHEET_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "range": "Sheet1!A1:N1",
                "majorDimension": "ROWS"
            })))
            .mount(&mock_server)
            .await;

        let source =
            GoogleSheetsMenuSource::with_base_url(mock_server.uri(), Some("test-key".to_string()));
        let err = source.parse_menu("sheet-1", "Burger Hub").await.unwrap_err();
        assert!(matches!(err, TransformError::EmptySheet(id) if id == "sheet-1"));
    }

    #[tokio::test]
    async fn test_api_error_is_fetch_error() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(SHEET_PATH))
            .respond_with(ResponseTemplate::new(403).set_body_string("permission denied"))
            .mount(&mock_server)
            .await;

        let source =
            GoogleSheetsMenuSource::with_base_url(mock_server.uri(), Some("test-key".to_string()));
        let err = source.parse_menu("sheet-1", "Burger Hub").await.unwrap_err();
        let message = err.to_string();
        assert!(matches!(err, TransformError::Fetch(_)));
        assert!(message.contains("403"), "{message}");
        assert!(message.contains("permission denied"), "{message}");
    }

    #[tokio::test]
    async fn test_missing_api_key() {
        let source = GoogleSheetsMenuSource::new(None);
        let err = source.parse_menu("sheet-1", "Burger Hub").await.unwrap_err();
        assert!(matches!(err, TransformError::NotConfigured(_)));
    }
}
