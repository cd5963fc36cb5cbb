//! Catalog and runtime reporters.
//!
//! [`ImageReporter`] answers "which images does this deployment declare"
//! purely from the catalog, without touching the runtime.
//! [`ContainerReporter`] is the runtime-facing counterpart: active
//! containers and their log tails, filtered by exact image reference.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use crate::catalog::{Catalog, CatalogSnapshot};
use crate::docker::{ActiveContainer, ContainerDriver, ContainerLogs};
use crate::error::DriverError;

/// Where an image reference comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageSource {
    /// Declared by one or more programs.
    Program,
    /// The catalog's global default image.
    Default,
}

/// One declared image and the programs using it.
#[derive(Debug, Clone, Serialize)]
pub struct ImageListing {
    pub image: String,
    pub repository: String,
    pub tag: String,
    pub source: ImageSource,
    /// Ids of the enabled programs that run on this image.
    pub programs: Vec<String>,
}

/// Derives image listings from the catalog.
pub struct ImageReporter {
    catalog: Arc<Catalog>,
}

impl ImageReporter {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self { catalog }
    }

    /// One entry per distinct image referenced by an enabled program, plus
    /// the default image (which carries the programs that fall back to it).
    pub fn declared_images(&self) -> Vec<ImageListing> {
        Self::from_snapshot(&self.catalog.snapshot())
    }

    fn from_snapshot(snapshot: &CatalogSnapshot) -> Vec<ImageListing> {
        let default_image = snapshot.settings.docker_image.clone();
        let mut by_image: BTreeMap<String, Vec<String>> = BTreeMap::new();
        by_image.entry(default_image.clone()).or_default();

        for program in snapshot.all_programs().filter(|p| p.enabled) {
            // compose-mode programs bring their own topology, not an image
            if program.compose_path.is_some() {
                continue;
            }
            let image = program.image.clone().unwrap_or_else(|| default_image.clone());
            by_image.entry(image).or_default().push(program.id.clone());
        }

        by_image
            .into_iter()
            .map(|(image, programs)| {
                let (repository, tag) = split_reference(&image);
                ImageListing {
                    source: if image == default_image {
                        ImageSource::Default
                    } else {
                        ImageSource::Program
                    },
                    repository,
                    tag,
                    image,
                    programs,
                }
            })
            .collect()
    }
}

/// Split an image reference into repository and tag. A colon inside the
/// registry host part (`host:5000/img`) is not a tag separator.
fn split_reference(image: &str) -> (String, String) {
    match image.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => (repo.to_string(), tag.to_string()),
        _ => (image.to_string(), "latest".to_string()),
    }
}

/// Thin passthrough over the runtime's container listing and logs.
pub struct ContainerReporter {
    driver: Arc<dyn ContainerDriver>,
}

impl ContainerReporter {
    pub fn new(driver: Arc<dyn ContainerDriver>) -> Self {
        Self { driver }
    }

    pub async fn active(&self) -> Result<Vec<ActiveContainer>, DriverError> {
        self.driver.list_active().await
    }

    /// Logs of running containers whose image matches `image` exactly
    /// (repository and tag).
    pub async fn logs_for_image(&self, image: &str) -> Result<Vec<ContainerLogs>, DriverError> {
        self.driver.logs_for_image(image).await
    }
}
