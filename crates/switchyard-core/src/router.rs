// ABOUTME: Backend router - turns a requested mode into an ordered candidate list
// ABOUTME: Explicit modes bypass health checks; auto filters by breaker and fails open

use crate::breaker::BreakerTable;
use crate::types::{BackendMode, BackendName};
use std::sync::Arc;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouterError {
    #[error("preferred backend order must not be empty")]
    EmptyOrder,
    #[error("backend {0} appears more than once in the preferred order")]
    Duplicate(BackendName),
}

/// Default preference when nothing is configured.
pub const DEFAULT_PREFERRED: [BackendName; 2] = [BackendName::Claude, BackendName::Codex];

#[derive(Debug, Clone)]
pub struct BackendRouter {
    preferred: Vec<BackendName>,
    breakers: Arc<BreakerTable>,
}

impl BackendRouter {
    pub fn new(preferred: Vec<BackendName>, breakers: Arc<BreakerTable>) -> Result<Self, RouterError> {
        validate_order(&preferred)?;
        Ok(Self {
            preferred,
            breakers,
        })
    }

    pub fn preferred(&self) -> &[BackendName] {
        &self.preferred
    }

    pub fn breakers(&self) -> &Arc<BreakerTable> {
        &self.breakers
    }

    /// Ordered candidates for one request. Never empty.
    pub fn select(&self, mode: BackendMode, now: Instant) -> Vec<BackendName> {
        match mode {
            BackendMode::Explicit(name) => vec![name],
            BackendMode::Auto => {
                let healthy: Vec<BackendName> = self
                    .preferred
                    .iter()
                    .copied()
                    .filter(|name| self.breakers.can_request(*name, now))
                    .collect();

                if healthy.is_empty() {
                    // Refusing here would keep an all-down fleet down forever
                    tracing::warn!(
                        preferred = ?self.preferred,
                        "All backends are tripped; offering full preferred order"
                    );
                    return self.preferred.clone();
                }
                healthy
            }
        }
    }
}

pub fn validate_order(order: &[BackendName]) -> Result<(), RouterError> {
    if order.is_empty() {
        return Err(RouterError::EmptyOrder);
    }
    for (i, name) in order.iter().enumerate() {
        if order[..i].contains(name) {
            return Err(RouterError::Duplicate(*name));
        }
    }
    Ok(())
}
