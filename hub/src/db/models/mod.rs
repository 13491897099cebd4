pub mod audit_log;
pub mod ban;
pub mod bid;
pub mod biome_holding;
pub mod biome_market;
pub mod chat_session;
pub mod enums;
pub mod land;
pub mod listing;
pub mod message;
pub mod transaction;
pub mod user;

pub use audit_log::{AuditLogEntry, NewAuditLogEntry};
pub use ban::{Ban, NewBan};
pub use bid::{Bid, NewBid};
pub use biome_holding::{BiomeHolding, NewBiomeHolding};
pub use biome_market::{BiomeMarket, BiomeMarketUpdate, NewBiomeMarket};
pub use chat_session::{ChatSession, NewChatSession};
pub use enums::{BiomeTag, ListingKind, ListingStatus, TransactionSource, TransactionType, UserRole};
pub use land::{Land, NewLand};
pub use listing::{Listing, NewListing};
pub use message::{Message, NewMessage};
pub use transaction::{NewTransaction, Transaction};
pub use user::{NewUser, User};
