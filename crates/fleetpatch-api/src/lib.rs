//! fleetpatch-api — REST API for patch campaigns.
//!
//! Thin axum layer over [`CampaignEngine`]: every handler maps one engine
//! operation onto a route and wraps the result in the common
//! `{success, data, error}` envelope.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/campaigns` | List campaigns |
//! | POST | `/api/v1/campaigns` | Start a campaign |
//! | GET | `/api/v1/campaigns/{id}` | Get a campaign record |
//! | POST | `/api/v1/campaigns/{id}/approve` | Deliver the approval signal |
//! | GET | `/api/v1/campaigns/{id}/progress` | Ordered progress log |
//! | GET | `/api/v1/campaigns/{id}/result` | Terminal outcome (`?wait=true` blocks) |
//! | POST | `/api/v1/campaigns/{id}/terminate` | Abort a running campaign |

pub mod handlers;

use axum::Router;
use axum::routing::{get, post};
use fleetpatch_saga::CampaignEngine;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub engine: CampaignEngine,
}

/// Build the API router.
pub fn build_router(engine: CampaignEngine) -> Router {
    let state = ApiState { engine };

    let api_routes = Router::new()
        .route(
            "/campaigns",
            get(handlers::list_campaigns).post(handlers::create_campaign),
        )
        .route("/campaigns/{id}", get(handlers::get_campaign))
        .route("/campaigns/{id}/approve", post(handlers::approve_campaign))
        .route("/campaigns/{id}/progress", get(handlers::get_progress))
        .route("/campaigns/{id}/result", get(handlers::get_result))
        .route("/campaigns/{id}/terminate", post(handlers::terminate_campaign))
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}
