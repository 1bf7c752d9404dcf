// API 路由汇总入口。
pub mod login;

use crate::envelope::Envelope;
use crate::session::ResolvedSession;
use crate::state::AppState;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use std::sync::Arc;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new().merge(login::router()).with_state(state)
}

/// 输出信封 JSON，新会话同时回写 cookie。
pub(crate) fn envelope_response(session: &ResolvedSession, envelope: Envelope) -> Response {
    let mut response = Json(envelope).into_response();
    session.apply_cookie(response.headers_mut());
    response
}
