use std::time::Duration;

use concierge_lib::audio::capture::DEFAULT_FRAME_DURATION_MS;
use concierge_lib::settings::{get_api_key, load_settings, settings_path, AppSettings};
use concierge_lib::{
    ConversationSession, ConversationState, CpalCapture, CpalOutput, SessionSnapshot,
};

#[tokio::main]
async fn main() {
    // Load .env file if present (for development convenience)
    // Silently ignore if not found - production uses system env vars
    let _ = dotenvy::dotenv();

    // wss:// endpoints need a process-wide crypto provider
    let _ = rustls::crypto::ring::default_provider().install_default();

    concierge_lib::init_logging();

    let settings = match settings_path() {
        Ok(path) => {
            log::info!("Loading settings from {:?}", path);
            load_settings(&path)
        }
        Err(e) => {
            log::warn!("Settings: {}, using defaults", e);
            AppSettings::default()
        }
    };

    let api_key = get_api_key();
    if api_key.is_none() {
        log::warn!(
            "{} not set, connecting without credentials",
            concierge_lib::settings::API_KEY_ENV
        );
    }

    let frame_ms = if settings.frame_duration_ms == 0 {
        DEFAULT_FRAME_DURATION_MS
    } else {
        settings.frame_duration_ms
    };
    let capture = CpalCapture::new(settings.input_device.clone(), frame_ms);
    let output = CpalOutput::new(settings.output_device.clone());

    let handle = ConversationSession::spawn(
        settings.session_settings(),
        settings.endpoint(api_key),
        Box::new(capture),
        Box::new(output),
    );

    let mut updates = handle.subscribe();
    handle.start(settings.conversation_config(settings.load_context()));
    log::info!("Conversation starting, press Ctrl-C to end");

    let mut last = SessionSnapshot::default();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("Ctrl-C received");
                break;
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = updates.borrow_and_update().clone();
                report(&last, &snapshot);
                let terminal = snapshot.state.is_terminal();
                last = snapshot;
                if terminal {
                    break;
                }
            }
        }
    }

    if tokio::time::timeout(Duration::from_secs(5), handle.close())
        .await
        .is_err()
    {
        log::warn!("Session did not close in time");
    }

    if let ConversationState::Error { message, .. } = &last.state {
        eprintln!("{}", message);
        std::process::exit(1);
    }
}

fn report(previous: &SessionSnapshot, current: &SessionSnapshot) {
    if previous.state != current.state {
        log::info!("Conversation: {:?}", current.state);
    }
    if current.user_text.len() != previous.user_text.len() && !current.user_text.is_empty() {
        log::info!("You: {}", current.user_text);
    }
    if current.model_text.len() != previous.model_text.len() && !current.model_text.is_empty() {
        log::info!("Concierge: {}", current.model_text);
    }
}
