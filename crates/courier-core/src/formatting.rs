//! Plain-text messages sent into a secret session, plus the operator alert
//! for items that ran out of retries.
//!
//! Secret sessions carry no parse mode, so everything here is plain text.

use crate::{
    domain::{MediaItem, OrderId, ProductMetadata},
    store::PendingRetry,
    utils::truncate_text,
};

const MISSING: &str = "N/A";

fn location(product: &ProductMetadata) -> String {
    format!(
        "{}, {}",
        product.city.as_deref().unwrap_or(MISSING),
        product.district.as_deref().unwrap_or(MISSING)
    )
}

fn product_name(product: &ProductMetadata) -> &str {
    if product.name.trim().is_empty() {
        "Product"
    } else {
        &product.name
    }
}

/// Order notification sent before the media.
pub fn order_notification(order_id: &OrderId, product: &ProductMetadata) -> String {
    format!(
        "🔐 ENCRYPTED DELIVERY\n\
         📦 Order #{order_id}\n\
         🏷️ {name}\n\
         📏 {size}\n\
         📍 {location}\n\
         💰 {price:.2} EUR\n\
         ⏬ Receiving secure media...",
        name = product_name(product),
        size = product.size.as_deref().unwrap_or(MISSING),
        location = location(product),
        price = product.price_eur,
    )
}

/// Closing summary with pickup instructions and the delivered count.
pub fn order_summary(
    order_id: &OrderId,
    product: &ProductMetadata,
    delivered: usize,
    total: usize,
) -> String {
    let instructions = product
        .instructions
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or("No additional details.");

    let mut out = format!(
        "📦 Product Details\n\
         🏷️ {name}\n\
         📏 {size}\n\
         📍 {location}\n\
         💰 {price:.2} EUR\n\
         📝 Pickup Instructions:\n\
         {instructions}\n\
         ✅ Order Completed\n\
         Order ID: {order_id}",
        name = product_name(product),
        size = product.size.as_deref().unwrap_or(MISSING),
        location = location(product),
        price = product.price_eur,
    );
    if total > 0 && delivered < total {
        out.push_str(&format!("\n⚠️ Media delivered: {delivered}/{total}"));
    }
    out.push_str("\nThank you! 🎉");
    out
}

/// Note sent in place of an item that could not be delivered (1-based index).
pub fn media_placeholder(index: usize, item: &MediaItem) -> String {
    format!("[Media {}: {}]", index + 1, item.filename)
}

/// Operator alert for a queued item that will not be retried again.
pub fn delivery_abandoned(retry: &PendingRetry) -> String {
    format!(
        "⚠️ Media Delivery Failed\n\n\
         Failed to deliver {kind} after {attempts} attempts.\n\n\
         User ID: {user}\n\
         Order ID: {order}\n\
         Media Type: {kind}\n\
         File: {file}\n\
         Last error: {error}\n\n\
         Please investigate and manually deliver if necessary.",
        kind = retry.kind,
        attempts = retry.attempts,
        user = retry.buyer.id.0,
        order = retry.order_id,
        file = retry.filename,
        error = truncate_text(&retry.last_error, 300),
    )
}
