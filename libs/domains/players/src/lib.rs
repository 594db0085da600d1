//! Players Domain
//!
//! A small player roster exposed to the RPC bridge as the `player` resource.
//!
//! ```text
//! ┌──────────────────┐
//! │ PlayerOperation  │  ← bridge verbs → service calls
//! └────────┬─────────┘
//! ┌────────▼─────────┐
//! │  PlayerService   │  ← validation
//! └────────┬─────────┘
//! ┌────────▼─────────┐
//! │ PlayerRepository │  ← trait + pooled in-memory store
//! └──────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use domain_players::{InMemoryPlayerRepository, PlayerOperation, PlayerService};
//! use std::sync::Arc;
//!
//! let repository = InMemoryPlayerRepository::new(10);
//! let operation = Arc::new(PlayerOperation::new(PlayerService::new(repository)));
//! // bootstrap.with_operation(operation)
//! ```

pub mod error;
pub mod memory;
pub mod models;
pub mod operation;
pub mod repository;
pub mod service;

pub use error::{PlayerError, PlayerResult};
pub use memory::InMemoryPlayerRepository;
pub use models::{NewPlayer, Player, PlayerName, PlayerTier, UpdatePlayer};
pub use operation::{PlayerOperation, RESOURCE};
pub use repository::PlayerRepository;
pub use service::PlayerService;
