//! Data model for a single remote proxy: identity, health state, and
//! bounded history. See [`Proxy`] for the full invariant set.

mod history;
mod proxy;

pub use history::{HistoryEntry, HistoryKind};
pub use proxy::{Anonymity, Proxy, ProxyType};
