mod entries;
mod feeds;
mod schema;
mod subscriptions;
mod translations;
mod types;

pub use schema::Database;
pub use types::{
    CachedTranslation, DatabaseError, Entry, EntryTranslation, FailureRecord, Feed, NewEntry,
    NewSubscription, Subscription, Validators,
};
