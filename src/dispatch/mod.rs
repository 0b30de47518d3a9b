//! Delivery of new entries to subscriptions.
//!
//! # Architecture
//!
//! - [`Dispatcher`] - fan-out, per-subscription ordering, translation, retry
//! - [`Destination`] - one implementation per platform
//! - [`RateGate`] - token bucket shared by all sends to one platform
//!
//! Send failures are classified by the destination ([`SendError`]); only the
//! dispatcher decides whether to retry, drop, or disable the subscription.

mod destination;
mod discord;
mod dispatcher;
mod message;
mod rate_limit;
mod telegram;
mod webhook;

pub use destination::{classify_status, retry_after_header, Destination, SendError};
pub use discord::DiscordDestination;
pub use dispatcher::{DispatchReport, Dispatcher, NoticeKind, SubscriptionNotice};
pub use message::ComposedMessage;
pub use rate_limit::RateGate;
pub use telegram::{escape_html, TelegramDestination};
pub use webhook::{WebhookDestination, WebhookPayload};
