//! Collaborators handed to legs and loopers at run time

use crate::messenger::Messenger;
use exchange::Product;
use std::sync::Arc;
use std::time::Duration;
use storage::Database;

/// Looper settings
#[derive(Debug, Clone)]
pub struct LooperOptions {
    /// Delay between attempts after a failed leg
    pub retry_delay: Duration,
}

impl Default for LooperOptions {
    fn default() -> Self {
        Self { retry_delay: Duration::from_secs(1) }
    }
}

/// Product, database and messenger one looper trades with
#[derive(Clone)]
pub struct Runtime {
    /// Product being traded
    pub product: Arc<dyn Product>,
    /// Store holding looper and leg state
    pub database: Arc<dyn Database>,
    /// Operator notifications
    pub messenger: Arc<dyn Messenger>,
    /// Settings
    pub options: LooperOptions,
}

impl Runtime {
    /// Bundle the collaborators with default options
    #[must_use]
    pub fn new(product: Arc<dyn Product>, database: Arc<dyn Database>, messenger: Arc<dyn Messenger>) -> Self {
        Self { product, database, messenger, options: LooperOptions::default() }
    }

    /// Replace the options
    #[must_use]
    pub fn with_options(mut self, options: LooperOptions) -> Self {
        self.options = options;
        self
    }
}
