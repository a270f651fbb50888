use std::process::exit;

use anyhow::Result;
use clap::Parser;
use image::{DynamicImage, RgbImage};
use log::debug;
use serde_json::json;
use spriteforge_contracts::config::Config;
use spriteforge_contracts::events::payload;
use spriteforge_contracts::manifest::{ProviderReport, SessionManifest};
use spriteforge_engine::classify::QueryClassifier;
use spriteforge_engine::pixel::{self, GridOptions, PixelArtOptions};
use spriteforge_engine::store::OutputStore;
use spriteforge_engine::ProviderRegistry;

/// Generate 16x16 pixel art sprites from a free-text query using every
/// configured image provider at once.
#[derive(Debug, Parser)]
#[command(name = "spriteforge", version, about)]
struct Cli {
    /// Free-text query, e.g. "draw me a cute cat"
    #[arg(short, long)]
    query: String,

    /// Variations to request from each provider
    #[arg(short, long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..=4))]
    variations: u32,

    /// Base directory for session output
    #[arg(short, long)]
    output_dir: Option<String>,

    /// Save raw provider images without pixel-art normalization
    #[arg(long)]
    no_pixel_art: bool,

    /// Verbose logging
    #[arg(long)]
    debug: bool,
}

fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let default_filter = if cli.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    match run(cli) {
        Ok(code) => exit(code),
        Err(err) => {
            eprintln!("spriteforge error: {err:#}");
            exit(1);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let mut config = Config::from_env();
    if let Some(output_dir) = &cli.output_dir {
        config.output_dir = output_dir.into();
    }
    config.validate()?;

    let classifier = QueryClassifier::new(&config)?;
    let classification = classifier.classify(&cli.query)?;
    if !classification.is_image_request {
        let reason = classification
            .rejection_reason
            .as_deref()
            .unwrap_or("query is not an image request");
        println!("Not an image request: {reason}");
        return Ok(1);
    }

    let description = classification.description_or(&cli.query).to_string();
    let prompt = if cli.no_pixel_art {
        description.clone()
    } else {
        pixel::enhance_prompt(&description)
    };
    debug!("prompt after enhancement: {prompt}");

    let registry = ProviderRegistry::from_config(&config);
    if registry.is_empty() {
        println!(
            "No image providers configured. Set at least one of OPENAI_API_KEY, \
             FREEPIK_API_KEY, REPLICATE_API_TOKEN or STABILITY_API_KEY."
        );
        return Ok(1);
    }
    println!(
        "Generating with {} provider(s): {}",
        registry.len(),
        registry.available().join(", ")
    );

    let store = OutputStore::new(&config.output_dir)?;
    let session = store.create_session()?;
    let mut manifest = SessionManifest::new(
        &cli.query,
        classification,
        session.path().to_string_lossy(),
    );

    let results = registry.generate_all(&prompt, cli.variations)?;
    for (provider, batch) in &results {
        let mut report = ProviderReport::new(batch.variations_requested);
        for error in &batch.errors {
            report.record_error(error.clone());
        }

        for (idx, raw) in batch.images.iter().enumerate() {
            let variation = idx as u32 + 1;
            let saved = prepare_image(raw, cli.no_pixel_art).and_then(|(sprite, preview)| {
                store.save_variation(&session, provider, variation, &sprite, preview.as_ref())
            });
            match saved {
                Ok(_) => report.record_saved(),
                Err(err) => report.record_error(format!("variation {variation}: {err:#}")),
            }
        }

        println!(
            "  {provider}: {} of {} image(s) saved",
            report.variations_generated, report.variations_requested
        );
        session.events().emit(
            "provider_completed",
            payload(json!({
                "provider": provider,
                "variations_requested": report.variations_requested,
                "variations_generated": report.variations_generated,
                "success": report.success,
            })),
        )?;
        manifest.record_provider(provider.clone(), report);
    }

    store.write_manifest(&session, &manifest)?;
    session.events().emit(
        "session_finished",
        payload(json!({"total_images_generated": manifest.total_images_generated})),
    )?;

    println!("\n{}", store.session_summary(&session)?);
    Ok(0)
}

/// Normalizes one raw provider image for saving. With `--no-pixel-art` the
/// raw raster is kept and no preview is produced.
fn prepare_image(raw: &DynamicImage, no_pixel_art: bool) -> Result<(RgbImage, Option<RgbImage>)> {
    if no_pixel_art {
        return Ok((raw.to_rgb8(), None));
    }
    let sprite = pixel::to_pixel_art(raw, PixelArtOptions::default())?;
    let preview = pixel::pixel_grid(&sprite, GridOptions::default());
    Ok((sprite, Some(preview)))
}
