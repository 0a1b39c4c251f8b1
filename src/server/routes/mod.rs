//! Route registration

mod channels;
mod dashboard;
mod mcp;
mod relay;

use actix_web::{HttpResponse, web};

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health))
        .service(
            web::scope("/v1")
                .route("/chat/completions", web::post().to(relay::chat_completions))
                .route("/completions", web::post().to(relay::completions))
                .route("/embeddings", web::post().to(relay::embeddings))
                .route("/images/generations", web::post().to(relay::images_generations))
                .route("/audio/speech", web::post().to(relay::audio_speech))
                .route("/audio/transcriptions", web::post().to(relay::audio_transcriptions))
                .route("/audio/translations", web::post().to(relay::audio_translations))
                .route("/rerank", web::post().to(relay::rerank)),
        )
        .service(
            web::scope("/api")
                .route("/dashboard", web::get().to(dashboard::get_dashboard))
                .route("/dashboard/{group}", web::get().to(dashboard::get_group_dashboard))
                .route("/dashboardv2", web::get().to(dashboard::get_time_series))
                .route(
                    "/dashboardv2/{group}",
                    web::get().to(dashboard::get_group_time_series),
                )
                .route("/channels", web::get().to(channels::list))
                .route("/channels/types", web::get().to(channels::types))
                .route("/channels", web::post().to(channels::create))
                .route("/channels/{id}", web::put().to(channels::update))
                .route("/channels/{id}", web::delete().to(channels::remove))
                .route("/channels/{id}/status", web::post().to(channels::set_status))
                .route("/channels/{id}/balance", web::get().to(channels::balance))
                .route("/channels/{id}/test/{model}", web::post().to(channels::test))
                .route("/mcp/public", web::get().to(mcp::list))
                .route("/mcp/public", web::post().to(mcp::upsert))
                .route("/mcp/public/{id}", web::delete().to(mcp::remove)),
        );
}

async fn health() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({ "status": "ok" }))
}
