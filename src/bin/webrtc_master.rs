//! WebRTC master endpoint
//!
//! Connects to the signaling channel, answers every viewer offer and reaps
//! dead sessions until Ctrl+C.
//!
//! Usage: webrtc-master [channel-name]
//!
//! Configuration comes from WEBRTC_MASTER_* environment variables; the
//! optional argument overrides the channel name.

use std::process::ExitCode;

use webrtc_master::signaling::TransportFactory;
use webrtc_master::{MasterConfig, SessionManager, SignalingTransport, WebRtcEngine, WsClientConfig, WsSignalingClient, RUNTIME};

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let mut config = match MasterConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Some(channel) = std::env::args().nth(1) {
        config.channel_name = channel;
    }
    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {}", e);
        return ExitCode::FAILURE;
    }

    let client_config = WsClientConfig::from_master(&config);
    let factory: TransportFactory = Box::new(move || {
        let client = WsSignalingClient::new(client_config.clone(), RUNTIME.handle().clone());
        Ok(Box::new(client) as Box<dyn SignalingTransport>)
    });

    let engine = match WebRtcEngine::new(RUNTIME.handle().clone()) {
        Ok(e) => e,
        Err(e) => {
            eprintln!("Failed to initialize WebRTC engine: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let manager = SessionManager::new(config, Box::new(engine), factory);

    if let Err(e) = manager.connect() {
        // The reaper keeps retrying from here
        log::error!("Signaling connect failed: {}", e);
        manager.request_recreate();
    }

    let m = manager.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        log::info!("Stopping...");
        m.interrupt();
    }) {
        eprintln!("Error setting Ctrl+C handler: {}", e);
        manager.disconnect();
        return ExitCode::FAILURE;
    }

    log::info!("Serving channel '{}'", manager.config().channel_name);
    manager.run_reaper();

    manager.shutdown_sessions();
    manager.disconnect();
    ExitCode::SUCCESS
}
