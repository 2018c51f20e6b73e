// main.rs — Command-line launcher.
//
//   gpu-histeq -l                       list platforms and devices
//   gpu-histeq -f photo.ppm             equalize on platform 0, device 0
//   gpu-histeq -p 1 -d 0 -f photo.png -o out.png --no-display
//   gpu-histeq --cpu -f photo.png       rayon reference backend
//
// Logging goes through env_logger; RUST_LOG overrides the default `info`.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::{error, info};

use gpu_histeq::gpu::device::list_platforms;
use gpu_histeq::io::{load_image, save_image};
use gpu_histeq::{
    ComputeBackend, CpuBackend, DeviceSelection, Equalizer, EqualizerConfig, GpuBackend, GpuOptions,
    HistEqError, Image,
};

#[derive(Parser, Debug)]
#[command(name = "gpu-histeq", version, about = "Histogram equalization on the GPU")]
struct Cli {
    /// Platform index (see --list).
    #[arg(short, long, default_value_t = 0)]
    platform: usize,

    /// Device index within the platform.
    #[arg(short, long, default_value_t = 0)]
    device: usize,

    /// List platforms and devices, then exit.
    #[arg(short, long)]
    list: bool,

    /// Input image.
    #[arg(short, long, default_value = "test.ppm")]
    file: PathBuf,

    /// Write the equalized image here.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Run the stages on the CPU instead of a GPU.
    #[arg(long)]
    cpu: bool,

    /// Skip kernel timestamps.
    #[arg(long)]
    no_profile: bool,

    /// Do not open image windows.
    #[arg(long)]
    no_display: bool,

    /// Log histogram, cumulative histogram and LUT after the run.
    #[arg(long)]
    dump_histograms: bool,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    if cli.list {
        let platforms = list_platforms();
        if platforms.is_empty() {
            println!("no platforms found");
        }
        for p in platforms {
            println!("{p}");
        }
        return ExitCode::SUCCESS;
    }

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // Compile errors carry the build log in their message
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<(), HistEqError> {
    let input = load_image(&cli.file)?;
    info!("loaded {} ({})", cli.file.display(), input.shape());

    let config = EqualizerConfig { log_histograms: cli.dump_histograms, report_timings: !cli.no_profile };

    if cli.cpu {
        let backend = CpuBackend::new().with_profiling(!cli.no_profile);
        equalize_with(Equalizer::with_config(backend, config), input, cli)
    } else {
        let options = GpuOptions {
            selection: DeviceSelection { platform: cli.platform, device: cli.device },
            profiling: !cli.no_profile,
        };
        let backend = GpuBackend::new(&options)?;
        equalize_with(Equalizer::with_config(backend, config), input, cli)
    }
}

fn equalize_with<B: ComputeBackend>(eq: Equalizer<B>, input: Image, cli: &Cli) -> Result<(), HistEqError> {
    info!("backend: {}", eq.backend().name());
    let display_input = (!cli.no_display).then(|| input.clone());

    let result = eq.equalize(input)?;

    if let Some(path) = &cli.output {
        save_image(path, &result.image)?;
        info!("wrote {}", path.display());
    }

    if let Some(original) = display_input {
        show(&original, &result.image);
    }
    Ok(())
}

#[cfg(feature = "display")]
fn show(input: &Image, output: &Image) {
    if let Err(e) = gpu_histeq::display::show(&[("input", input), ("equalized", output)]) {
        error!("display failed: {e}");
    }
}

#[cfg(not(feature = "display"))]
fn show(_input: &Image, _output: &Image) {
    info!("built without the `display` feature; pass --no-display to silence this");
}
