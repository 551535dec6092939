//! PayOS API types.

use serde::{Deserialize, Serialize};

/// Response envelope used by every PayOS endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope<T> {
    /// "00" on success.
    pub code: String,
    /// Human-readable description.
    #[serde(default)]
    pub desc: String,
    /// Payload; absent or null on errors.
    pub data: Option<T>,
}

/// Checkout link request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatePaymentLink {
    /// Order code.
    pub order_code: i64,
    /// Amount in VND.
    pub amount: u64,
    /// Transfer description (PayOS caps this at 25 characters).
    pub description: String,
    /// Where the buyer lands after paying.
    pub return_url: String,
    /// Where the buyer lands after cancelling.
    pub cancel_url: String,
}

/// Signed request body sent to PayOS.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CreatePaymentLinkBody<'a> {
    pub order_code: i64,
    pub amount: u64,
    pub description: &'a str,
    pub return_url: &'a str,
    pub cancel_url: &'a str,
    pub signature: String,
}

/// A created checkout link.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutLink {
    /// Hosted checkout page.
    pub checkout_url: String,
    /// VietQR payload.
    #[serde(default)]
    pub qr_code: Option<String>,
    /// PayOS payment link id.
    #[serde(default)]
    pub payment_link_id: Option<String>,
}

/// Payment link status as reported by PayOS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayPaymentStatus {
    /// Waiting for transfer.
    Pending,
    /// Transfer seen, settling.
    Processing,
    /// Money received.
    Paid,
    /// Cancelled by buyer or merchant.
    Cancelled,
    /// Link expired.
    Expired,
    /// Anything newer than this client.
    #[serde(other)]
    Unknown,
}

impl GatewayPaymentStatus {
    /// The link can still be paid.
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Pending | Self::Processing)
    }
}

/// Payment link details.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayPaymentInfo {
    /// Order code.
    pub order_code: i64,
    /// Requested amount.
    pub amount: u64,
    /// Amount received so far.
    #[serde(default)]
    pub amount_paid: u64,
    /// Current status.
    pub status: GatewayPaymentStatus,
}

/// Cancel request body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CancelBody<'a> {
    pub cancellation_reason: &'a str,
}

/// Inbound webhook as posted by PayOS.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookPayload {
    /// Outer result code.
    #[serde(default)]
    pub code: String,
    /// Outer description.
    #[serde(default)]
    pub desc: String,
    /// Outer success flag.
    #[serde(default)]
    pub success: bool,
    /// Signed data object, kept raw so the signature covers exactly what was sent.
    pub data: serde_json::Value,
    /// HMAC-SHA256 over the sorted `data` fields.
    pub signature: String,
}

/// Verified webhook data.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookData {
    /// Order code.
    pub order_code: i64,
    /// Amount transferred.
    pub amount: u64,
    /// Bank reference.
    #[serde(default)]
    pub reference: Option<String>,
    /// Result code, "00" on success.
    pub code: String,
    /// Result description.
    #[serde(default)]
    pub desc: Option<String>,
    /// PayOS payment link id.
    #[serde(default)]
    pub payment_link_id: Option<String>,
}
