//! Event wire schema — the single source of truth for abuse analytics.
//!
//! Events are flat JSON objects on the broker channel. `data` is an opaque,
//! action-specific payload that the consumer stores verbatim.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Action performed when the event was captured.
///
/// Closed set of gateway decisions plus the demo backend's business actions;
/// unknown values pass through untouched so new producers never break the
/// consumer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Action {
    // Gateway decisions
    TokenIssued,
    TokenValidated,
    // Business actions from the protected backend
    ViewBooks,
    ViewBookDetail,
    SearchBooks,
    UserRegister,
    UserLogin,
    UserLogout,
    ViewCart,
    AddToCart,
    RemoveFromCart,
    Checkout,
    ViewOrder,
    ViewOrders,
    CheckInventory,
    ListStores,
    NotFound,
    Unauthorized,
    Error,
    // Pass-through for actions this build does not know about
    Other(String),
}

impl Action {
    pub fn as_str(&self) -> &str {
        match self {
            Action::TokenIssued => "token-issued",
            Action::TokenValidated => "token-validated",
            Action::ViewBooks => "view_books",
            Action::ViewBookDetail => "view_book_detail",
            Action::SearchBooks => "search_books",
            Action::UserRegister => "user_register",
            Action::UserLogin => "user_login",
            Action::UserLogout => "user_logout",
            Action::ViewCart => "view_cart",
            Action::AddToCart => "add_to_cart",
            Action::RemoveFromCart => "remove_from_cart",
            Action::Checkout => "checkout",
            Action::ViewOrder => "view_order",
            Action::ViewOrders => "view_orders",
            Action::CheckInventory => "check_inventory",
            Action::ListStores => "list_stores",
            Action::NotFound => "not_found",
            Action::Unauthorized => "unauthorized",
            Action::Error => "error",
            Action::Other(s) => s,
        }
    }
}

impl From<String> for Action {
    fn from(s: String) -> Self {
        match s.as_str() {
            "token-issued" => Action::TokenIssued,
            "token-validated" => Action::TokenValidated,
            "view_books" => Action::ViewBooks,
            "view_book_detail" => Action::ViewBookDetail,
            "search_books" => Action::SearchBooks,
            "user_register" => Action::UserRegister,
            "user_login" => Action::UserLogin,
            "user_logout" => Action::UserLogout,
            "view_cart" => Action::ViewCart,
            "add_to_cart" => Action::AddToCart,
            "remove_from_cart" => Action::RemoveFromCart,
            "checkout" => Action::Checkout,
            "view_order" => Action::ViewOrder,
            "view_orders" => Action::ViewOrders,
            "check_inventory" => Action::CheckInventory,
            "list_stores" => Action::ListStores,
            "not_found" => Action::NotFound,
            "unauthorized" => Action::Unauthorized,
            "error" => Action::Error,
            _ => Action::Other(s),
        }
    }
}

impl From<Action> for String {
    fn from(a: Action) -> Self {
        a.as_str().to_string()
    }
}

/// Validation outcome, only meaningful for `token-validated` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pass,
    Fail,
}

/// A single authentication/business decision, as published to the broker
/// and persisted as an Event node.
///
/// `event_id` is globally unique and immutable; events are never mutated
/// after creation except to flip `archived`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    pub timestamp: DateTime<Utc>,
    pub client_ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub archived: bool,
}

impl Event {
    /// Starts a new event with a fresh time-ordered id and the current time.
    pub fn new(action: Action, client_ip: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            event_id: Uuid::now_v7().to_string(),
            action,
            status: None,
            timestamp: Utc::now(),
            client_ip: client_ip.into(),
            user_agent: None,
            device_type: None,
            path: path.into(),
            query: None,
            session_id: None,
            user_id: None,
            tenant_id: None,
            token_id: None,
            data: None,
            archived: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_wire_names() {
        assert_eq!(
            serde_json::to_string(&Action::TokenIssued).unwrap(),
            "\"token-issued\""
        );
        assert_eq!(
            serde_json::to_string(&Action::AddToCart).unwrap(),
            "\"add_to_cart\""
        );
        assert_eq!(
            serde_json::from_str::<Action>("\"token-validated\"").unwrap(),
            Action::TokenValidated
        );
    }

    #[test]
    fn test_unknown_action_passes_through() {
        let action: Action = serde_json::from_str("\"price_scrape\"").unwrap();
        assert_eq!(action, Action::Other("price_scrape".to_string()));
        assert_eq!(serde_json::to_string(&action).unwrap(), "\"price_scrape\"");
    }

    #[test]
    fn test_event_serialization_omits_absent_fields() {
        let event = Event::new(Action::TokenIssued, "203.0.113.45", "/api/v1/store-1/books");
        let json = serde_json::to_string(&event).unwrap();

        assert!(json.contains("\"action\":\"token-issued\""));
        assert!(json.contains("\"archived\":false"));
        assert!(!json.contains("\"status\""));
        assert!(!json.contains("\"user_id\""));
    }

    #[test]
    fn test_event_round_trip() {
        let mut event = Event::new(Action::TokenValidated, "203.0.113.45", "/api/v1/store-1/cart");
        event.status = Some(Status::Fail);
        event.session_id = Some("sess-1".to_string());
        event.data = Some(serde_json::json!({"reason": "expired"}));

        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();

        assert_eq!(back.event_id, event.event_id);
        assert_eq!(back.status, Some(Status::Fail));
        assert_eq!(back.data.unwrap()["reason"], "expired");
    }

    #[test]
    fn test_event_ids_are_unique() {
        let a = Event::new(Action::TokenIssued, "203.0.113.1", "/");
        let b = Event::new(Action::TokenIssued, "203.0.113.1", "/");
        assert_ne!(a.event_id, b.event_id);
    }
}
