// SPDX-License-Identifier: MIT OR Apache-2.0
//! rumi-daemon
//!
//! Bearer-authenticated HTTP control-plane over the kernel components.
//! All `/api/*` routes require `Authorization: Bearer <token>`; the token
//! is compared in constant time. `/health` is open.

#![deny(unsafe_code)]

pub mod auth;
pub mod error;
pub mod flows;
pub mod routes;
pub mod state;

pub use flows::{FlowRunner, NullFlowRunner};
pub use state::AppState;

use axum::middleware;
use axum::routing::{delete, get, post};
use axum::Router;
use std::sync::Arc;

/// Build the daemon router over an initialized [`AppState`].
pub fn router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        // Packs.
        .route("/api/packs", get(routes::list_packs))
        .route("/api/packs/scan", post(routes::scan_packs))
        .route("/api/packs/import", post(routes::import_pack))
        .route("/api/packs/apply", post(routes::apply_pack))
        .route("/api/packs/{pack_id}/approve", post(routes::approve_pack))
        .route("/api/packs/{pack_id}/reject", post(routes::reject_pack))
        .route("/api/packs/{pack_id}", delete(routes::uninstall_pack))
        // Secrets.
        .route("/api/secrets", get(routes::list_secrets))
        .route("/api/secrets/set", post(routes::set_secret))
        .route("/api/secrets/delete", post(routes::delete_secret))
        // Stores.
        .route("/api/stores", get(routes::list_stores))
        .route("/api/stores/create", post(routes::create_store))
        .route("/api/stores/delete", post(routes::delete_store))
        .route("/api/stores/cas", post(routes::cas))
        .route("/api/stores/keys", post(routes::list_keys))
        .route("/api/stores/batch_get", post(routes::batch_get))
        .route("/api/stores/shared", get(routes::list_shared))
        .route("/api/stores/shared/approve", post(routes::approve_sharing))
        .route("/api/stores/shared/revoke", post(routes::revoke_sharing))
        // Units.
        .route("/api/units", get(routes::list_units))
        .route("/api/units/publish", post(routes::publish_unit))
        .route("/api/units/execute", post(routes::execute_unit))
        // Capability.
        .route("/api/capability/execute", post(routes::execute_capability))
        // Privileges (grants).
        .route("/api/privileges/{permission_type}", get(routes::list_privileges))
        .route("/api/privileges/grant", post(routes::grant_privilege))
        .route("/api/privileges/revoke", post(routes::revoke_privilege))
        .route("/api/privileges/revoke_all", post(routes::revoke_all_privileges))
        .route("/api/privileges/delete", post(routes::delete_grant))
        // Trust allowlists.
        .route("/api/trust/{flavor}", get(routes::list_trusted))
        .route("/api/trust/{flavor}/add", post(routes::add_trusted))
        .route("/api/trust/{flavor}/remove", post(routes::remove_trusted))
        // Audit.
        .route("/api/audit", get(routes::query_audit))
        // Flows.
        .route("/api/flows/{flow_id}/run", post(routes::run_flow))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::require_bearer,
        ));

    Router::new()
        .route("/health", get(routes::health))
        .merge(api)
        .with_state(state)
}
