// 登录接口：POST 表单登录，GET 查询当前会话是否已登录。
use crate::api::envelope_response;
use crate::auth;
use crate::state::AppState;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::get;
use axum::{Form, Router};
use serde::Deserialize;
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/LoginInstr", get(login_status).post(login))
}

#[derive(Debug, Deserialize)]
struct LoginForm {
    #[serde(default)]
    userid: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

async fn login(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Form(form): Form<LoginForm>,
) -> Response {
    let mut resolved = state.sessions.resolve(&headers);
    let envelope = auth::login(
        &state.executor,
        resolved.session.as_ref(),
        form.userid.as_deref(),
        form.password.as_deref(),
    );
    if envelope.status {
        state.sessions.persist(&mut resolved);
    }
    envelope_response(&resolved, envelope)
}

async fn login_status(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let resolved = state.sessions.resolve(&headers);
    envelope_response(&resolved, auth::login_status(resolved.session.as_ref()))
}
