use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use idscan_core::ProcessorConfig;
use idscan_ocr::image::Rgb;
use idscan_ocr::{IdCardProcessor, OcrBackend, TempFileCleanup};
use std::io::Read;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "idscan")]
#[command(about = "Extract identity fields from a photographed Romanian ID card")]
#[command(version)]
pub struct Cli {
    /// Processor config file (defaults to config.toml in the user config directory)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory holding the Tesseract language data
    #[arg(long, global = true)]
    pub tesseract_data: Option<PathBuf>,

    /// Log filter, e.g. `debug` or `idscan_ocr=trace` (overrides RUST_LOG)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Decode a card photo and print its fields as JSON
    Scan { image: PathBuf },

    /// Same as `scan`, reading base64 (optionally a data URL) from a file or stdin
    ScanBase64 {
        #[arg(default_value = "-")]
        input: PathBuf,
        /// Leave the decoded temporary image on disk
        #[arg(long)]
        keep_temp: bool,
    },

    /// Save the normalized, binarized card image
    Preprocess { image: PathBuf, out: PathBuf },

    /// Save the normalized image with every field box outlined
    Grid {
        image: PathBuf,
        out: PathBuf,
        /// Outline color as `r,g,b`
        #[arg(long, default_value = "0,255,0", value_parser = parse_color)]
        color: Rgb<u8>,
        #[arg(long, default_value_t = 2)]
        thickness: u32,
    },

    /// Print an image file as base64
    Encode { image: PathBuf },

    /// Print the effective configuration as TOML
    Config,
}

pub fn run(cli: Cli) -> anyhow::Result<()> {
    let config = resolve_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Config => {
            print!("{}", config.to_toml()?);
        }
        Commands::Encode { image } => {
            let text = idscan_ocr::image_to_base64(&image)
                .with_context(|| format!("Failed to read {}", image.display()))?;
            println!("{text}");
        }
        Commands::Scan { image } => {
            let processor = processor(config, cli.tesseract_data)?;
            let doc = processor
                .process_id_card(&image)
                .with_context(|| format!("Failed to scan {}", image.display()))?;
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }
        Commands::ScanBase64 { input, keep_temp } => {
            let data = read_input(&input)?;
            let cleanup = if keep_temp { TempFileCleanup::Keep } else { TempFileCleanup::Delete };
            let processor = processor(config, cli.tesseract_data)?;
            let doc = processor
                .process_id_card_from_base64_with(&data, cleanup)
                .context("Failed to scan base64 image")?;
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }
        Commands::Preprocess { image, out } => {
            let processor = processor(config, cli.tesseract_data)?;
            processor
                .save_processed_image(&image, &out)
                .with_context(|| format!("Failed to preprocess {}", image.display()))?;
            tracing::info!(out = %out.display(), "processed image written");
        }
        Commands::Grid { image, out, color, thickness } => {
            let processor = processor(config, cli.tesseract_data)?;
            processor
                .draw_crop_grid(&image, &out, color, thickness)
                .with_context(|| format!("Failed to draw crop grid for {}", image.display()))?;
            tracing::info!(out = %out.display(), "crop grid written");
        }
    }

    Ok(())
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("ro", "idscan", "idscan")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Explicit path must exist; the per-user default is used only when present.
fn resolve_config(explicit: Option<&Path>) -> anyhow::Result<ProcessorConfig> {
    if let Some(path) = explicit {
        return ProcessorConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()));
    }
    match default_config_path() {
        Some(path) if path.is_file() => {
            tracing::debug!(path = %path.display(), "using user config");
            ProcessorConfig::load(&path)
                .with_context(|| format!("Failed to load config {}", path.display()))
        }
        _ => Ok(ProcessorConfig::default()),
    }
}

fn backend(tesseract_data: Option<PathBuf>) -> Box<dyn OcrBackend> {
    #[cfg(feature = "tesseract")]
    {
        let data = tesseract_data.map(|p| p.to_string_lossy().into_owned());
        Box::new(idscan_ocr::TesseractRecognizer::new(data))
    }
    #[cfg(not(feature = "tesseract"))]
    {
        let cli = idscan_ocr::TesseractCli::new();
        match tesseract_data {
            Some(dir) => Box::new(cli.with_data_dir(dir)),
            None => Box::new(cli),
        }
    }
}

fn processor(
    config: ProcessorConfig,
    tesseract_data: Option<PathBuf>,
) -> anyhow::Result<IdCardProcessor<Box<dyn OcrBackend>>> {
    Ok(IdCardProcessor::with_config(backend(tesseract_data), config)?)
}

fn read_input(input: &Path) -> anyhow::Result<String> {
    if input == Path::new("-") {
        let mut data = String::new();
        std::io::stdin()
            .read_to_string(&mut data)
            .context("Failed to read base64 from stdin")?;
        Ok(data)
    } else {
        std::fs::read_to_string(input)
            .with_context(|| format!("Failed to read {}", input.display()))
    }
}

fn parse_color(s: &str) -> anyhow::Result<Rgb<u8>> {
    let parts: Vec<&str> = s.split(',').map(str::trim).collect();
    let [r, g, b] = parts.as_slice() else {
        bail!("expected r,g,b, got '{s}'");
    };
    Ok(Rgb([r.parse()?, g.parse()?, b.parse()?]))
}
