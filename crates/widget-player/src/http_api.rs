//! HTTP control API.
//!
//! Reads are served from the runtime's published snapshot; writes become
//! [`PlayerCommand`]s for the runtime thread.

use std::net::SocketAddr;

use actix_web::{App, HttpResponse, HttpServer, Responder, get, middleware::Logger, post, web};
use serde::{Deserialize, Serialize};
use widget_engine::backend::DeviceInfo;
use widget_engine::backend::device;
use widget_types::{EngineStatus, TransportAction};

use crate::player::{CommandError, PlayerCommand, PlayerHandle, QueueTarget};
use crate::state::SharedState;

/// Shared handler state.
#[derive(Clone)]
pub struct ApiState {
    pub player: PlayerHandle,
    pub state: SharedState,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    online: bool,
}

#[derive(Serialize)]
struct StatusResponse {
    #[serde(flatten)]
    status: EngineStatus,
    container: Option<String>,
    device: Option<String>,
}

#[derive(Serialize)]
struct DevicesResponse {
    devices: Vec<DeviceInfo>,
    selected: Option<String>,
}

#[derive(Deserialize)]
struct SeekBody {
    ms: Option<u64>,
    delta_ms: Option<i64>,
}

#[derive(Deserialize)]
struct PlayBody {
    index: Option<usize>,
    dir: Option<String>,
}

#[derive(Serialize)]
struct ResumeResponse {
    started: bool,
}

fn error_response(err: CommandError) -> HttpResponse {
    let body = serde_json::json!({ "error": err.to_string() });
    match err {
        CommandError::Offline => HttpResponse::ServiceUnavailable().json(body),
        CommandError::Timeout => HttpResponse::GatewayTimeout().json(body),
    }
}

fn bad_request(message: &str) -> HttpResponse {
    HttpResponse::BadRequest().json(serde_json::json!({ "error": message }))
}

/// Run a blocking request against the runtime off the async executor.
async fn request<T, F>(player: &PlayerHandle, build: F) -> Result<T, CommandError>
where
    T: Send + 'static,
    F: FnOnce(crossbeam_channel::Sender<T>) -> PlayerCommand + Send + 'static,
{
    let player = player.clone();
    web::block(move || player.request(build))
        .await
        .unwrap_or(Err(CommandError::Offline))
}

#[get("/health")]
async fn health(data: web::Data<ApiState>) -> impl Responder {
    HttpResponse::Ok().json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        online: data.state.lock().online,
    })
}

#[get("/status")]
async fn status(data: web::Data<ApiState>) -> impl Responder {
    let published = data.state.snapshot();
    HttpResponse::Ok().json(StatusResponse {
        status: published.status,
        container: published.container,
        device: published.device,
    })
}

#[get("/now-playing")]
async fn now_playing(data: web::Data<ApiState>) -> impl Responder {
    HttpResponse::Ok().json(data.state.snapshot().now_playing)
}

#[get("/notices")]
async fn notices(data: web::Data<ApiState>) -> impl Responder {
    HttpResponse::Ok().json(data.state.snapshot().notices)
}

#[get("/devices")]
async fn devices(data: web::Data<ApiState>) -> impl Responder {
    let selected = data.state.lock().device.clone();
    let listed = web::block(|| device::list_devices(&cpal::default_host())).await;
    match listed {
        Ok(Ok(devices)) => HttpResponse::Ok().json(DevicesResponse { devices, selected }),
        Ok(Err(err)) => HttpResponse::InternalServerError().json(serde_json::json!({ "error": format!("{err:#}") })),
        Err(err) => HttpResponse::InternalServerError().json(serde_json::json!({ "error": err.to_string() })),
    }
}

#[get("/settings")]
async fn get_settings(data: web::Data<ApiState>) -> impl Responder {
    HttpResponse::Ok().json(data.state.snapshot().settings)
}

#[post("/settings")]
async fn update_settings(data: web::Data<ApiState>, body: web::Json<serde_json::Value>) -> impl Responder {
    let patch = body.into_inner();
    match request(&data.player, move |reply| PlayerCommand::UpdateSettings(patch, reply)).await {
        Ok(Ok(settings)) => HttpResponse::Ok().json(settings),
        Ok(Err(message)) => bad_request(&message),
        Err(err) => error_response(err),
    }
}

#[post("/settings/apply")]
async fn apply_settings(data: web::Data<ApiState>) -> impl Responder {
    match request(&data.player, PlayerCommand::ApplySettings).await {
        Ok(Ok(())) => HttpResponse::Ok().finish(),
        Ok(Err(message)) => HttpResponse::InternalServerError().json(serde_json::json!({ "error": message })),
        Err(err) => error_response(err),
    }
}

#[post("/transport/{action}")]
async fn transport(data: web::Data<ApiState>, path: web::Path<String>) -> impl Responder {
    let slug = path.into_inner();
    let Some(action) = TransportAction::from_slug(&slug) else {
        return HttpResponse::NotFound().json(serde_json::json!({ "error": format!("unknown action: {slug}") }));
    };
    match data.player.send(PlayerCommand::Transport(action)) {
        Ok(()) => HttpResponse::Ok().finish(),
        Err(err) => error_response(err),
    }
}

#[post("/seek")]
async fn seek(data: web::Data<ApiState>, body: web::Json<SeekBody>) -> impl Responder {
    let cmd = match (body.ms, body.delta_ms) {
        (Some(ms), None) => PlayerCommand::Seek { ms },
        (None, Some(delta_ms)) => PlayerCommand::SeekBy { delta_ms },
        _ => return bad_request("expected exactly one of ms or delta_ms"),
    };
    match data.player.send(cmd) {
        Ok(()) => HttpResponse::Ok().finish(),
        Err(err) => error_response(err),
    }
}

#[post("/queue/play")]
async fn queue_play(data: web::Data<ApiState>, body: web::Json<PlayBody>) -> impl Responder {
    let body = body.into_inner();
    let target = match (body.dir, body.index) {
        (Some(path), start) => QueueTarget::Directory { path, start },
        (None, Some(index)) => QueueTarget::Index(index),
        (None, None) => return bad_request("expected index or dir"),
    };
    match request(&data.player, move |reply| PlayerCommand::Play(target, reply)).await {
        Ok(Ok(())) => HttpResponse::Ok().finish(),
        Ok(Err(message)) => bad_request(&message),
        Err(err) => error_response(err),
    }
}

#[post("/resume")]
async fn resume(data: web::Data<ApiState>) -> impl Responder {
    match request(&data.player, PlayerCommand::ConfirmResume).await {
        Ok(started) => HttpResponse::Ok().json(ResumeResponse { started }),
        Err(err) => error_response(err),
    }
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(health)
        .service(status)
        .service(now_playing)
        .service(notices)
        .service(devices)
        .service(get_settings)
        .service(apply_settings)
        .service(update_settings)
        .service(transport)
        .service(seek)
        .service(queue_play)
        .service(resume);
}

/// Serve the API until the actix system stops.
pub async fn serve(bind: SocketAddr, api: ApiState) -> std::io::Result<()> {
    let data = web::Data::new(api);
    tracing::info!(bind = %bind, "http api listening");
    HttpServer::new(move || {
        App::new()
            .wrap(Logger::new("%r %s %Dms").exclude("/status").exclude("/health"))
            .app_data(data.clone())
            .configure(configure)
    })
    .workers(2)
    .bind(bind)?
    .run()
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::StatusCode;
    use actix_web::test;
    use crossbeam_channel::Receiver;
    use widget_types::{Notice, NoticeLevel};

    fn api() -> (ApiState, Receiver<PlayerCommand>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (
            ApiState {
                player: PlayerHandle::new(tx),
                state: SharedState::new(),
            },
            rx,
        )
    }

    macro_rules! app {
        ($api:expr) => {
            test::init_service(App::new().app_data(web::Data::new($api)).configure(configure)).await
        };
    }

    #[actix_web::test]
    async fn health_reports_version() {
        let (api, _rx) = api();
        let app = app!(api);
        let resp: serde_json::Value = test::call_and_read_body_json(&app, test::TestRequest::get().uri("/health").to_request()).await;
        assert_eq!(resp["status"], "ok");
        assert_eq!(resp["online"], false);
    }

    #[actix_web::test]
    async fn transport_slugs_become_commands() {
        let (api, rx) = api();
        let app = app!(api);
        let resp = test::call_service(&app, test::TestRequest::post().uri("/transport/toggle").to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(matches!(rx.try_recv(), Ok(PlayerCommand::Transport(TransportAction::TogglePause))));

        let resp = test::call_service(&app, test::TestRequest::post().uri("/transport/rewind").to_request()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert!(rx.try_recv().is_err());
    }

    #[actix_web::test]
    async fn seek_accepts_absolute_or_relative() {
        let (api, rx) = api();
        let app = app!(api);
        let req = test::TestRequest::post().uri("/seek").set_json(serde_json::json!({ "ms": 1500 })).to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);
        assert!(matches!(rx.try_recv(), Ok(PlayerCommand::Seek { ms: 1500 })));

        let req = test::TestRequest::post().uri("/seek").set_json(serde_json::json!({ "delta_ms": -5000 })).to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);
        assert!(matches!(rx.try_recv(), Ok(PlayerCommand::SeekBy { delta_ms: -5000 })));

        let req = test::TestRequest::post().uri("/seek").set_json(serde_json::json!({})).to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn reads_come_from_published_state() {
        let (api, _rx) = api();
        {
            let mut published = api.state.lock();
            published.container = Some("/music/album".to_string());
            published.status.queue_len = 3;
            published.notices.push(Notice {
                id: 4,
                level: NoticeLevel::Error,
                message: "network error".to_string(),
                ttl_ms: Some(15_000),
            });
        }
        let app = app!(api);
        let status_body: serde_json::Value = test::call_and_read_body_json(&app, test::TestRequest::get().uri("/status").to_request()).await;
        assert_eq!(status_body["queue_len"], 3);
        assert_eq!(status_body["container"], "/music/album");

        let notice_list: Vec<Notice> = test::call_and_read_body_json(&app, test::TestRequest::get().uri("/notices").to_request()).await;
        assert_eq!(notice_list.len(), 1);
        assert_eq!(notice_list[0].id, 4);
    }

    #[actix_web::test]
    async fn settings_patch_round_trips_through_runtime() {
        let (api, rx) = api();
        let worker = std::thread::spawn(move || {
            if let Ok(PlayerCommand::UpdateSettings(patch, reply)) = rx.recv() {
                let current = widget_engine::settings::Settings::default();
                let _ = reply.send(crate::player::patch_settings(&current, patch));
            }
        });
        let app = app!(api);
        let req = test::TestRequest::post()
            .uri("/settings")
            .set_json(serde_json::json!({ "crossfade_ms": 3000 }))
            .to_request();
        let settings: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(settings["crossfade_ms"], 3000);
        worker.join().unwrap();
    }

    #[actix_web::test]
    async fn queue_play_needs_a_target() {
        let (api, _rx) = api();
        let app = app!(api);
        let req = test::TestRequest::post().uri("/queue/play").set_json(serde_json::json!({})).to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn offline_runtime_is_unavailable() {
        let (api, rx) = api();
        drop(rx);
        let app = app!(api);
        let resp = test::call_service(&app, test::TestRequest::post().uri("/resume").to_request()).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
