use std::{collections::HashSet, fmt, str::FromStr};

use async_trait::async_trait;
use chrono::NaiveDate;
use log::warn;
use tokio::io::AsyncWrite;

use crate::{error::ClientError, model::Asset};

pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// A remote photo library that can be listed, downloaded from and deleted from.
#[async_trait]
pub trait PhotoLibrary: Sync {
    async fn assets(&self) -> Result<Vec<Asset>, ClientError>;

    /// Streams the original bytes of `asset` into `dest`, returning the byte count.
    async fn download(
        &self,
        asset: &Asset,
        dest: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64, ClientError>;

    async fn delete(&self, asset: &Asset) -> Result<(), ClientError>;
}

/// The last capture date (inclusive) an asset may have to be acted upon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cutoff(NaiveDate);

impl Cutoff {
    pub fn admits(&self, date: NaiveDate) -> bool {
        date <= self.0
    }
}

impl FromStr for Cutoff {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NaiveDate::parse_from_str(s.trim(), DATE_FORMAT)
            .map(Cutoff)
            .map_err(|_| format!("invalid date '{s}', expected YYYY-MM-DD"))
    }
}

impl fmt::Display for Cutoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(DATE_FORMAT))
    }
}

pub fn qualifies(asset: &Asset, cutoff: Cutoff) -> bool {
    asset.capture_date().is_some_and(|date| cutoff.admits(date))
}

/// Keeps the assets captured on or before `cutoff`, each record at most once.
/// Assets without a capture date never qualify.
pub fn qualifying(assets: Vec<Asset>, cutoff: Cutoff) -> Vec<Asset> {
    let mut seen = HashSet::new();
    assets
        .into_iter()
        .filter(|asset| {
            if asset.capture_date().is_none() {
                warn!("Could not determine creation date for {}, skipping.", asset.filename);
                return false;
            }
            qualifies(asset, cutoff) && seen.insert(asset.id.clone())
        })
        .collect()
}
