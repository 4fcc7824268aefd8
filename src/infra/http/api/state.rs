use std::sync::Arc;

use crate::application::timestamps::TimestampService;

use super::rate_limit::ApiRateLimiter;

#[derive(Clone)]
pub struct ApiState {
    pub timestamps: Arc<TimestampService>,
    pub rate_limiter: Arc<ApiRateLimiter>,
}
