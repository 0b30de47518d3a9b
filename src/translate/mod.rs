//! Machine translation of entry text.
//!
//! - [`TranslationProvider`]: one HTTP backend (DeepL, OpenAI-compatible, Google)
//! - [`TranslationCache`]: durable + in-memory tiers in front of a provider,
//!   with concurrent identical requests coalesced into one call

mod cache;
mod deepl;
mod google;
mod openai;
mod provider;

pub use cache::TranslationCache;
pub use deepl::DeeplProvider;
pub use google::GoogleProvider;
pub use openai::OpenAiProvider;
pub use provider::{provider_from_config, TranslateError, TranslationProvider};
