use actix_web::{dev::Service, web, App, HttpServer};
use realtime_chat_service::{config, error, logging, routes, state::AppState};

#[actix_web::main]
async fn main() -> Result<(), error::AppError> {
    logging::init_tracing();
    let cfg = config::Config::from_env()?;
    let port = cfg.port;

    let state = AppState::build(cfg).await?;
    let background = state.start_background();

    let bind_addr = format!("0.0.0.0:{port}");
    tracing::info!(
        %bind_addr,
        session_policy = ?state.config.session_policy,
        "starting realtime-chat-service"
    );

    let rest_state = state.clone();
    let server = HttpServer::new(move || {
        let cors = actix_cors::Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .wrap(cors)
            .wrap_fn(|req, srv| {
                let method = req.method().clone();
                let path = req.path().to_string();
                let fut = srv.call(req);
                async move {
                    let res = fut.await?;
                    tracing::debug!(%method, %path, status = res.status().as_u16(), "request");
                    Ok(res)
                }
            })
            .app_data(web::Data::new(rest_state.clone()))
            .configure(routes::configure)
    })
    .bind(&bind_addr)
    .map_err(|e| error::AppError::StartServer(format!("bind REST: {e}")))?
    .run();

    let result = server
        .await
        .map_err(|e| error::AppError::StartServer(format!("REST server: {e}")));

    for task in background {
        task.abort();
    }
    tracing::info!("realtime-chat-service stopped");
    result
}
