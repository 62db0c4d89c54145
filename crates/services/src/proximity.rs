//! # Proximity Query Engine
//!
//! "Posts near (lat, lng)" by true ground distance. The radius is a parameter;
//! [`DEFAULT_RADIUS_METERS`] is only the policy the facade applies.

use std::sync::Arc;

use domains::{DomainResult, GeoPoint, PostRepository, PostView, UserRepository};
use tracing::{debug, instrument};

use crate::{validation, views};

pub const DEFAULT_RADIUS_METERS: f64 = 5000.0;

pub struct ProximityEngine {
    posts: Arc<dyn PostRepository>,
    users: Arc<dyn UserRepository>,
}

impl ProximityEngine {
    pub fn new(posts: Arc<dyn PostRepository>, users: Arc<dyn UserRepository>) -> Self {
        Self { posts, users }
    }

    /// Posts within `radius_meters` (inclusive) of `center`, newest first,
    /// each joined with its author.
    #[instrument(skip(self))]
    pub async fn nearby(&self, center: GeoPoint, radius_meters: f64) -> DomainResult<Vec<PostView>> {
        validation::radius(radius_meters)?;

        let posts = self.posts.find_within_radius(center, radius_meters).await?;
        debug!(found = posts.len(), "radius query");
        views::post_views(self.users.as_ref(), posts).await
    }
}
