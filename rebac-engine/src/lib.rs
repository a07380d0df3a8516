//! Relationship-based access control (ReBAC) engine
//!
//! This crate implements a Zanzibar-style authorization engine providing:
//! - A declarative schema language compiled into immutable, content-addressed versions
//! - A relationship tuple store (in-memory, or any [`TupleRepository`])
//! - Permission checks over union, intersection, exclusion and relation chains
//! - Permission tree expansion for debugging
//! - Lookup compilation into SQL predicates over stored tuples
//!
//! # Core Concepts
//!
//! - **Entity**: Any resource that can be protected (e.g., document, folder, organization)
//! - **Subject**: An entity that can be granted access, or a subject set such as
//!   `group:eng#member`
//! - **Relation**: A stored relationship between an entity and a subject (e.g., owner, viewer)
//! - **Permission**: A computed expression over relations (e.g., `view = owner or parent.view`)
//! - **Tuple**: A relationship statement: "entity has relation to subject"
//!
//! # Example
//!
//! ```rust
//! use rebac_engine::{AuthorizationEngine, CheckRequest, Entity, Subject};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = AuthorizationEngine::in_memory();
//!
//!     let version = engine.write_schema(
//!         "entity user {}
//!          entity document {
//!              relation owner @user
//!              permission view = owner
//!          }",
//!     )?;
//!
//!     // Define a relationship
//!     engine
//!         .write_tuple("document:1#owner@user:alice".parse()?, &version)
//!         .await?;
//!
//!     // Check permission
//!     let request = CheckRequest::new(Subject::user("alice"), "view", Entity::new("document", "1"));
//!     assert!(engine.check(&request).await?.is_allowed());
//!
//!     Ok(())
//! }
//! ```

pub mod check;
pub mod config;
pub mod engine;
pub mod error;
pub mod expand;
pub mod graph;
pub mod lookup;
pub mod models;
pub mod repository;
pub mod schema;

pub use check::PermissionChecker;
pub use crate::config::EngineConfig;
pub use engine::*;
pub use error::*;
pub use expand::SubjectExpander;
pub use graph::{EdgeKind, GraphEdge, GraphNode, NodeKind, SchemaGraph};
pub use lookup::{Filter, LookupEngine, SubjectMatch};
pub use models::*;
pub use repository::{InMemoryTupleRepository, TupleRepository};
pub use schema::*;
