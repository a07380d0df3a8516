use crate::{error::Result, models::*};
use async_trait::async_trait;
use dashmap::DashSet;
use std::sync::Arc;
use tracing::debug;

/// Repository interface for storing relationship tuples.
///
/// The store is schema-agnostic: tuples are validated structurally only, so
/// they can be written before or after a compatible schema exists.
#[async_trait]
pub trait TupleRepository: Send + Sync {
    /// Write a single tuple. Writing a present tuple is a no-op.
    async fn write_tuple(&self, tuple: Tuple) -> Result<()>;

    /// Delete a single tuple. Deleting an absent tuple is a no-op.
    async fn delete_tuple(&self, tuple: Tuple) -> Result<()>;

    /// Apply writes, then deletes. Every tuple is validated before any is applied.
    async fn batch_write(&self, request: WriteRequest) -> Result<()>;

    /// Read tuples matching the filter, in no particular order
    async fn read_tuples(&self, filter: &TupleFilter) -> Result<Vec<Tuple>>;

    async fn tuple_exists(&self, tuple: &Tuple) -> Result<bool>;

    async fn count(&self) -> Result<usize>;
}

/// In-memory tuple repository for testing and embedded use
#[derive(Debug, Clone, Default)]
pub struct InMemoryTupleRepository {
    tuples: Arc<DashSet<Tuple>>,
}

impl InMemoryTupleRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TupleRepository for InMemoryTupleRepository {
    async fn write_tuple(&self, tuple: Tuple) -> Result<()> {
        tuple.validate()?;
        if self.tuples.insert(tuple) {
            debug!("Stored new tuple");
        }
        Ok(())
    }

    async fn delete_tuple(&self, tuple: Tuple) -> Result<()> {
        tuple.validate()?;
        self.tuples.remove(&tuple);
        Ok(())
    }

    async fn batch_write(&self, request: WriteRequest) -> Result<()> {
        for tuple in request.writes.iter().chain(request.deletes.iter()) {
            tuple.validate()?;
        }

        for tuple in request.writes {
            self.tuples.insert(tuple);
        }
        for tuple in request.deletes {
            self.tuples.remove(&tuple);
        }
        Ok(())
    }

    async fn read_tuples(&self, filter: &TupleFilter) -> Result<Vec<Tuple>> {
        Ok(self
            .tuples
            .iter()
            .filter(|tuple| filter.matches(tuple.key()))
            .map(|tuple| tuple.key().clone())
            .collect())
    }

    async fn tuple_exists(&self, tuple: &Tuple) -> Result<bool> {
        Ok(self.tuples.contains(tuple))
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.tuples.len())
    }
}
