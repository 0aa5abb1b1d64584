// Spreadsheet-to-menu transform seam

use async_trait::async_trait;
use thiserror::Error;

use crate::menu::Menu;

/// Errors produced while turning a spreadsheet into a menu
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("spreadsheet {0} has no rows")]
    EmptySheet(String),

    #[error("spreadsheet source is not configured: {0}")]
    NotConfigured(String),

    #[error("failed to fetch spreadsheet: {0}")]
    Fetch(String),

    #[error("invalid spreadsheet data: {0}")]
    InvalidData(String),
}

/// Produces a menu from an external spreadsheet
#[async_trait]
pub trait MenuSource: Send + Sync {
    async fn parse_menu(
        &self,
        spreadsheet_id: &str,
        restaurant_name: &str,
    ) -> Result<Menu, TransformError>;
}
