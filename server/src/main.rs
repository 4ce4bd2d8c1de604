use server::launch_app;
use server::shell::build_state;
use updater::{SchedulingPermit, SettingManager};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let setting_manager = SettingManager::load(None).await?;
    let (listen_addr, notifications) = {
        let settings = setting_manager.read().await;
        (settings.listen_addr.clone(), settings.notification_filter())
    };
    let state = build_state(setting_manager).await?;
    let orchestrator = state.orchestrator.clone();

    let session = orchestrator.on_session_start().await;
    if notifications.any() {
        orchestrator
            .start_background(SchedulingPermit::granted())
            .await?;
    } else {
        log::info!("All notifications are off, background checks stay disabled");
    }

    let listener = std::net::TcpListener::bind(&listen_addr)?;
    log::info!("Listening on {}", listen_addr);
    launch_app(listener, state, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Could not listen for ctrl-c: {}", e);
        }
    })
    .await?;

    log::info!("Shutting down");
    orchestrator.stop_background().await;
    session.end().await;
    Ok(())
}
