//! Periodic purge of finished tasks.

use std::time::Duration;

use super::ticker::{Periodic, Shutdown};
use crate::config::RetentionSettings;
use crate::db::Db;

pub struct Retention {
    db: Db,
    older_than_days: u32,
    interval: Duration,
}

impl Retention {
    pub fn new(db: Db, settings: &RetentionSettings) -> Self {
        Self {
            db,
            older_than_days: settings.older_than_days,
            interval: Duration::from_secs(settings.interval_secs),
        }
    }

    /// Purge on the configured interval until shutdown.
    pub async fn run(self, shutdown: Shutdown) {
        let Self {
            db,
            older_than_days,
            interval,
        } = self;
        Periodic::new("retention", interval)
            .run(shutdown, move || {
                let db = db.clone();
                async move { db.purge_old_tasks(older_than_days).await.map(|_| ()) }
            })
            .await;
    }
}
