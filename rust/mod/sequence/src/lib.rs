//! Document sequence numbering.
//!
//! A [`model::Sequence`] turns a counter into document identifiers such as
//! `INV/2024/0001`. Counters are either gap-allowed (native counters that
//! never block) or gap-free (locked rows advanced inside a
//! [`txn::Transaction`]). Sequences may be partitioned into per-period
//! [`model::DateRange`]s created on first use.

pub mod api;
pub mod cache;
pub mod counter;
pub mod interpolate;
pub mod model;
pub mod service;
pub mod txn;

use std::sync::Arc;

use axum::Router;
use openerp_core::{Authenticator, Module, ServiceError};
use openerp_kv::KVStore;
use openerp_sql::SQLStore;

use service::{SequenceService, SequenceSettings};

/// The sequence module, mounted by `openerpd` under `/sequence`.
pub struct SequenceModule {
    service: Arc<SequenceService>,
}

impl SequenceModule {
    /// Create the module and initialise its schema.
    pub fn new(
        sql: Arc<dyn SQLStore>,
        kv: Arc<dyn KVStore>,
        auth: Arc<dyn Authenticator>,
        settings: SequenceSettings,
    ) -> Result<Self, ServiceError> {
        let service = SequenceService::new(sql, kv, auth, settings)?;
        Ok(Self {
            service: Arc::new(service),
        })
    }

    /// The service, for in-process callers numbering their documents.
    pub fn service(&self) -> &Arc<SequenceService> {
        &self.service
    }
}

impl Module for SequenceModule {
    fn name(&self) -> &str {
        "sequence"
    }

    fn routes(&self) -> Router {
        api::router(Arc::clone(&self.service))
    }
}
