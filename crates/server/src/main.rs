use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::get,
    Router,
};
use serde::Serialize;
use server_api::{
    assemble_customer_listing, assemble_landing, assemble_movie_listing, ApiContext,
};
use storage::Storage;
use tera::Tera;
use tower_http::services::ServeDir;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod config;
mod error;

use config::{load_settings, load_site_metadata, prepare_database_url};
use error::PageError;

struct AppState {
    api: ApiContext<Storage>,
    templates: Tera,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::connect(&database_url, settings.database_max_connections)
        .await
        .map_err(|error| {
            error!(
                %database_url,
                %error,
                "failed to open catalog database; verify the url and file permissions"
            );
            error
        })?;
    let site = load_site_metadata(&settings.site_metadata_path)?;
    let templates = load_templates(&settings.templates_glob)?;
    info!(
        metadata_keys = site.len(),
        policy = ?settings.rental_failure_policy,
        "catalog ready"
    );

    let api = ApiContext::new(storage, site)
        .with_rental_failure_policy(settings.rental_failure_policy);
    let state = AppState { api, templates };
    let app = build_router(Arc::new(state), &settings.static_dir);

    let addr: SocketAddr = settings
        .server_bind
        .parse()
        .with_context(|| format!("invalid bind address '{}'", settings.server_bind))?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn load_templates(glob: &str) -> anyhow::Result<Tera> {
    let mut templates =
        Tera::new(glob).with_context(|| format!("failed to parse templates from '{glob}'"))?;
    if templates.get_template_names().next().is_none() {
        anyhow::bail!("no templates matched '{glob}'");
    }
    templates.autoescape_on(vec![".html.tera"]);
    Ok(templates)
}

fn build_router(state: Arc<AppState>, static_dir: &str) -> Router {
    Router::new()
        .route("/", get(landing))
        .route("/movies", get(movies))
        .route("/customers", get(customers))
        .route("/healthz", get(healthz))
        .fallback_service(ServeDir::new(static_dir))
        .with_state(state)
}

async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.api.storage.health_check().await {
        Ok(()) => (StatusCode::OK, "ok"),
        Err(error) => {
            error!(%error, "health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
        }
    }
}

async fn landing(State(state): State<Arc<AppState>>) -> Result<Html<String>, PageError> {
    let page = assemble_landing(&state.api).await?;
    render(&state.templates, "index.html.tera", &page)
}

async fn movies(State(state): State<Arc<AppState>>) -> Result<Html<String>, PageError> {
    let page = assemble_movie_listing(&state.api).await?;
    render(&state.templates, "movies.html.tera", &page)
}

async fn customers(State(state): State<Arc<AppState>>) -> Result<Html<String>, PageError> {
    let page = assemble_customer_listing(&state.api).await?;
    render(&state.templates, "customers.html.tera", &page)
}

fn render<T: Serialize>(
    templates: &Tera,
    name: &str,
    page: &T,
) -> Result<Html<String>, PageError> {
    let context = tera::Context::from_serialize(page)?;
    Ok(Html(templates.render(name, &context)?))
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
