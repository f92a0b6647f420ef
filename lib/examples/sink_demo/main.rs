use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use clap::{Arg, Command};
use log::{info, warn};

use v4l2sink::device::{Device, DeviceConfig, DisplayDevice};
use v4l2sink::sink::{Monitor, PolicyFileSignal, SinkConfig, SinkController};
use v4l2sink::{Format, Rect};
use v4l2sink_utils::framegen::FrameGenerator;
use v4l2sink_utils::virtual_display::VirtualDisplay;

struct Options {
    format: Format,
    frames: Option<usize>,
    rate: u32,
    target: Option<Rect>,
    policy_file: Option<String>,
}

fn parse_size(s: &str) -> anyhow::Result<(usize, usize)> {
    let (width, height) = s
        .split_once('x')
        .ok_or_else(|| anyhow!("invalid size {:?}, expected WIDTHxHEIGHT", s))?;
    Ok((
        width.parse().context("invalid width")?,
        height.parse().context("invalid height")?,
    ))
}

fn run<D: DisplayDevice>(
    sink: SinkController<D>,
    options: Options,
    lets_quit: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    if let Some(target) = options.target {
        sink.set_target(target);
    }
    let format = sink
        .start(&options.format)
        .context("cannot start the sink")?;
    info!("Sink started with format {:?}", format);

    let _monitor = match options.policy_file {
        Some(path) => Some(Monitor::spawn(
            sink.clone(),
            PolicyFileSignal::new(path),
            Duration::from_millis(100),
        )?),
        None => None,
    };

    let mut generator = FrameGenerator::new(&format)?;
    let frame_period = Duration::from_secs(1) / options.rate.max(1);
    let start = Instant::now();
    let mut frame_count = 0usize;

    while !lets_quit.load(Ordering::SeqCst) {
        if let Some(frames) = options.frames {
            if frame_count >= frames {
                break;
            }
        }

        let mut buffer = sink.acquire()?;
        generator.next_frame(&mut *buffer)?;
        buffer.set_timestamp(frame_period * frame_count as u32);
        if let Err(e) = sink.show(buffer) {
            warn!("Cannot show frame {}: {}", frame_count, e);
        }
        frame_count += 1;

        // Produce frames at the requested rate.
        let next_frame = start + frame_period * frame_count as u32;
        if let Some(delay) = next_frame.checked_duration_since(Instant::now()) {
            std::thread::sleep(delay);
        }

        print!("\rFrames produced: {}", frame_count);
    }
    println!();

    let elapsed = start.elapsed();
    sink.stop().context("cannot stop the sink")?;

    let stats = sink.stats();
    println!(
        "{} frames in {:.2}s: {} shown, {} dropped, {} software fallbacks, {} recovery passes",
        frame_count,
        elapsed.as_secs_f64(),
        stats.shown,
        stats.dropped,
        stats.software_fallbacks,
        stats.recovery_passes,
    );

    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let matches = Command::new("V4L2 sink demo")
        .arg(
            Arg::new("device")
                .long("device")
                .takes_value(true)
                .help("Path to the V4L2 output device. A virtual display is used if omitted"),
        )
        .arg(
            Arg::new("frames")
                .long("frames")
                .takes_value(true)
                .value_parser(clap::value_parser!(usize))
                .help("Stop after showing a given number of frames"),
        )
        .arg(
            Arg::new("size")
                .long("size")
                .takes_value(true)
                .default_value("640x480")
                .help("Size of the frames to show (e.g. \"640x480\")"),
        )
        .arg(
            Arg::new("pixel_format")
                .long("pixel_format")
                .takes_value(true)
                .default_value("UYVY")
                .help("Fourcc of the frames to show (UYVY, YUYV or RGB3)"),
        )
        .arg(
            Arg::new("rate")
                .long("rate")
                .takes_value(true)
                .value_parser(clap::value_parser!(u32))
                .default_value("30")
                .help("Number of frames produced per second"),
        )
        .arg(
            Arg::new("target")
                .long("target")
                .takes_value(true)
                .help("Size of the display area, placed at the origin (e.g. \"1280x720\")"),
        )
        .arg(
            Arg::new("policy_file")
                .long("policy_file")
                .takes_value(true)
                .help("File holding the display mode; a non-zero mode suspends the sink"),
        )
        .get_matches();

    let size = parse_size(
        matches
            .get_one::<String>("size")
            .map(String::as_str)
            .unwrap_or("640x480"),
    )?;
    let fourcc: [u8; 4] = matches
        .get_one::<String>("pixel_format")
        .map(String::as_str)
        .unwrap_or("UYVY")
        .as_bytes()
        .try_into()
        .context("pixel format must be a 4 characters fourcc")?;
    let target = matches
        .get_one::<String>("target")
        .map(|s| parse_size(s))
        .transpose()?
        .map(|(width, height)| Rect::new(0, 0, width as u32, height as u32));

    let options = Options {
        format: Format::from((&fourcc, size)),
        frames: matches.get_one::<usize>("frames").copied(),
        rate: matches.get_one::<u32>("rate").copied().unwrap_or(30),
        target,
        policy_file: matches.get_one::<String>("policy_file").cloned(),
    };

    let lets_quit = Arc::new(AtomicBool::new(false));
    {
        let lets_quit = Arc::clone(&lets_quit);
        ctrlc::set_handler(move || {
            lets_quit.store(true, Ordering::SeqCst);
        })
        .expect("Failed to set Ctrl-C handler.");
    }

    match matches.get_one::<String>("device") {
        Some(path) => {
            let device = Device::open(Path::new(path), DeviceConfig::new().non_blocking_dqbuf())
                .with_context(|| format!("cannot open {}", path))?;
            let sink = SinkController::new(device, SinkConfig::new())?;
            run(sink, options, lets_quit)
        }
        None => {
            info!("No device given, using a virtual display");
            let display = VirtualDisplay::with_rate(options.rate);
            let sink = SinkController::new(display, SinkConfig::new())?;
            run(sink, options, lets_quit)
        }
    }
}
