use std::path::PathBuf;

use clap::{Parser, Subcommand};
use zarrs_ngff::config::Settings;
use zarrs_ngff::convert::build_ome_zarr;
use zarrs_ngff::identity::identifier_from_fileref_ids;
use zarrs_ngff::metadata::{base_scales_in_meters, group_info, read_group_metadata};
use zarrs_ngff::proxy::NgffImage;
use zarrs_ngff::pyramid::{DownsampleMethod, node_path};
use zarrs_ngff::render::{RenderingView, render_padded};
use zarrs_ngff::storage::{open_existing_store, open_filesystem_store};
use zarrs_ngff::zarrs::array::Array;

#[derive(Parser, Debug)]
#[command(name = "zarrs-ngff", version, about)]
struct Args {
    /// JSON settings file; defaults apply to anything it leaves out.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Rechunk a base array into a new OME-NGFF pyramid.
    Zarr2zarr {
        input: PathBuf,
        output: PathBuf,
        /// Path of the base array inside the input hierarchy.
        #[arg(long, default_value = "0")]
        base_array: String,
        #[arg(long, default_value = "image")]
        name: String,
        #[arg(long)]
        n_levels: Option<usize>,
        #[arg(long)]
        downsample_method: Option<DownsampleMethod>,
    },
    /// Print the sizes, levels and scaling of an OME-NGFF image as JSON.
    Info {
        input: PathBuf,
        #[arg(long, default_value_t = false)]
        strict_units: bool,
    },
    /// Render a padded 2D preview of an OME-NGFF image.
    Render {
        input: PathBuf,
        output: PathBuf,
        #[arg(long, default_value_t = 512)]
        width: u32,
        #[arg(long, default_value_t = 512)]
        height: u32,
        #[arg(long)]
        t: Option<u64>,
        #[arg(long)]
        z: Option<u64>,
        #[arg(long, default_value_t = false)]
        no_autocontrast: bool,
    },
    /// Print the image identifier derived from file reference ids.
    Identifier { ids: Vec<String> },
}

fn load_settings(path: Option<&PathBuf>) -> zarrs_ngff::Result<Settings> {
    match path {
        Some(path) => Ok(serde_json::from_reader(std::fs::File::open(path)?)?),
        None => Ok(Settings::default()),
    }
}

fn main() -> zarrs_ngff::Result<()> {
    env_logger::init();
    let args = Args::parse();
    let mut settings = load_settings(args.config.as_ref())?;

    match args.command {
        Commands::Zarr2zarr {
            input,
            output,
            base_array,
            name,
            n_levels,
            downsample_method,
        } => {
            if let Some(n) = n_levels {
                settings.pyramid.n_levels = n;
            }
            if let Some(method) = downsample_method {
                settings.pyramid.downsample_method = method;
            }
            let source = open_existing_store(&input)?;
            let base = Array::open(source.clone(), &node_path(&base_array))?;
            let base_scales = read_group_metadata(&source, "/")
                .and_then(|m| base_scales_in_meters(&m))
                .unwrap_or_else(|e| {
                    log::warn!("using default coordinate scales: {e}");
                    settings.pyramid.default_coordinate_scales.clone()
                });
            let store = open_filesystem_store(&output)?;
            let report = build_ome_zarr(&base, &store, &settings.pyramid, &name, &base_scales)?;
            log::info!("built levels {:?}, skipped {:?}", report.built, report.skipped);
        }
        Commands::Info {
            input,
            strict_units,
        } => {
            let store = open_existing_store(&input)?;
            let image = NgffImage::open(&store, !strict_units)?;
            let levels = group_info(&store, &image.path_keys)?;
            let summary = serde_json::json!({ "image": image, "levels": levels });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Render {
            input,
            output,
            width,
            height,
            t,
            z,
            no_autocontrast,
        } => {
            let store = open_existing_store(&input)?;
            let image = NgffImage::open(&store, true)?;
            let view = RenderingView {
                t,
                z,
                ..Default::default()
            };
            let mut render_settings = settings.render.clone();
            render_settings.autocontrast &= !no_autocontrast;
            let rendered = render_padded(&store, &image, &view, (width, height), &render_settings)?;
            rendered.save(&output)?;
            log::info!("wrote {}", output.display());
        }
        Commands::Identifier { ids } => {
            println!("{}", identifier_from_fileref_ids(&ids));
        }
    }
    Ok(())
}
