//! Demo: run the monitor against the scripted engine.
//!
//! Usage: `vlm_monitor [prompts.json]`

use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use log::{info, warn};

use vlm_monitor::engine::mock::{MockEngine, MockReply};
use vlm_monitor::logger::{setup_logging, LoggingConfig};
use vlm_monitor::{BackendConfig, Frame, MonitorBackend, PromptConfig};

const RETAIL_PROMPTS: &str = r#"{
    "system_prompt": "You are a retail store camera assistant. Answer briefly.",
    "user_prompt": "Look at the person in the aisle. {details}",
    "use_cases": {
        "shopping": {
            "options": ["empty", "pickup", "browsing"],
            "keywords": {
                "empty": ["no person", "nobody"],
                "pickup": ["grabbing", "picking", "examining"],
                "browsing": ["walking", "cart"]
            },
            "details": "Describe what the person is doing in a few words."
        }
    }
}"#;

const FRAMES: usize = 6;

fn load_prompts() -> Result<PromptConfig> {
    match std::env::args().nth(1) {
        Some(path) => PromptConfig::load(&path).with_context(|| format!("loading {path}")),
        None => Ok(PromptConfig::from_json_str(RETAIL_PROMPTS)?),
    }
}

fn scripted_engine() -> MockEngine {
    let engine = MockEngine::new();
    let handle = engine.handle();
    for reply in [
        "nobody in the aisle",
        "a woman walking with a cart",
        "a man grabbing a cereal box",
        "someone examining product labels",
    ] {
        handle.push_context_reply(
            MockReply::text(reply).with_token_delay(Duration::from_millis(40)),
        );
    }
    handle.push_direct_reply(
        MockReply::text("A shopper is holding a cereal box near the top shelf.")
            .with_token_delay(Duration::from_millis(30)),
    );
    engine
}

fn main() -> Result<()> {
    if let Err(e) = setup_logging(&LoggingConfig::default()) {
        eprintln!("Failed to set up logging: {e}");
    }

    let prompts = load_prompts()?;
    let use_case = prompts.active_use_case()?;
    info!(
        "Use cases: {:?}, active: {}",
        prompts.use_case_names(),
        use_case.name
    );

    let config = BackendConfig {
        warmup_ms: 200,
        cooldown_ms: 500,
        ..BackendConfig::default()
    };
    let backend = MonitorBackend::start(scripted_engine(), use_case, config)?;

    let deadline = Instant::now() + Duration::from_secs(10);
    while !backend.is_ready() {
        if Instant::now() > deadline {
            bail!("backend did not become ready (phase: {:?})", backend.phase());
        }
        thread::sleep(Duration::from_millis(50));
    }

    for i in 0..FRAMES {
        let shade = (i * 40) as u8;
        backend.submit_frame(Frame::solid_bgr(640, 480, [shade, shade, shade]));
        thread::sleep(Duration::from_millis(400));
        if let Some(result) = backend.poll_result() {
            println!(
                "[{}] {} ({:?})",
                result.elapsed_str(),
                result.display_label(),
                result.kind
            );
        }
    }

    let question = "What is the shopper holding?";
    match backend.ask(Frame::solid_bgr(640, 480, [90, 90, 90]), question) {
        Ok(answer) => println!("Q: {question}\nA: {} ({})", answer.text, answer.elapsed_str()),
        Err(e) => warn!("Question failed: {e}"),
    }

    backend.shutdown();
    Ok(())
}
