use anyhow::{Context, Result, bail};
use crossbeam::channel::{self, Receiver};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use trackio::audio::cpal_backend::enumerate_device_names;
use trackio::audio::{
    AudioConfig, AudioEngine, AudioEvent, CaptureTrack, ChannelListener,
    CutPreviewPlaybackPolicy, CpalBackend, MemoryTrack, PlayableTrack, StreamOptions,
    TransportTracks, export_track, import_wav,
};

fn print_help() {
    println!("trackio - audio streaming engine for multitrack playback and recording");
    println!();
    println!("USAGE:");
    println!("    trackio [OPTIONS] <COMMAND>");
    println!();
    println!("COMMANDS:");
    println!("    play <file.wav>                      Play a file through the output device");
    println!("    record <out.wav> <seconds>           Record from the input device");
    println!("    preview <file.wav> <start> <length>  Play a file skipping [start, start+length)");
    println!("    devices                              List audio devices");
    println!();
    println!("OPTIONS:");
    println!("    -h, --help          Print this help message");
    println!("    --debug             Enable debug logging");
    println!("    --config <file>     Load engine settings from a TOML file");
    println!("    --loop              Loop playback until interrupted");
    println!("    --speed <factor>    Playback speed");
    println!("    --play <file.wav>   Play a file while recording");
    println!();
    println!("EXAMPLES:");
    println!("    trackio play mix.wav --speed 1.5");
    println!("    trackio record take.wav 10 --play backing.wav");
    println!("    trackio preview mix.wav 12.0 3.5");
}

struct Args {
    debug: bool,
    config: Option<String>,
    looped: bool,
    speed: f64,
    play: Option<String>,
    positional: Vec<String>,
}

fn parse_args() -> Result<Option<Args>> {
    let mut args = Args {
        debug: false,
        config: None,
        looped: false,
        speed: 1.0,
        play: None,
        positional: Vec::new(),
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(None),
            "--debug" => args.debug = true,
            "--loop" => args.looped = true,
            "--config" => args.config = Some(iter.next().context("--config needs a path")?),
            "--play" => args.play = Some(iter.next().context("--play needs a path")?),
            "--speed" => {
                args.speed = iter
                    .next()
                    .context("--speed needs a value")?
                    .parse()
                    .context("invalid --speed")?;
            }
            _ => args.positional.push(arg),
        }
    }
    Ok(Some(args))
}

fn seconds(value: Option<&String>, what: &str) -> Result<f64> {
    value
        .with_context(|| format!("missing {what}"))?
        .parse()
        .with_context(|| format!("invalid {what}"))
}

fn main() -> Result<()> {
    let Some(args) = parse_args()? else {
        print_help();
        return Ok(());
    };

    let level = if args.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    let _ = tracing_subscriber::fmt().with_max_level(level).try_init();

    let config = match &args.config {
        Some(path) => AudioConfig::load(path).with_context(|| format!("load config {path}"))?,
        None => AudioConfig::default(),
    };

    match args.positional.first().map(String::as_str) {
        Some("devices") => list_devices(),
        Some("play") => {
            let path = args.positional.get(1).context("missing file to play")?;
            play(config, &args, path, None)
        }
        Some("preview") => {
            let path = args.positional.get(1).context("missing file to preview")?;
            let gap_start = seconds(args.positional.get(2), "gap start")?;
            let gap_length = seconds(args.positional.get(3), "gap length")?;
            play(config, &args, path, Some((gap_start, gap_length)))
        }
        Some("record") => {
            let path = args.positional.get(1).context("missing output file")?;
            let duration = seconds(args.positional.get(2), "duration")?;
            record(config, &args, path, duration)
        }
        _ => {
            print_help();
            Ok(())
        }
    }
}

fn list_devices() -> Result<()> {
    let (inputs, outputs) = enumerate_device_names()?;
    println!("Input devices:");
    for name in inputs {
        println!("    {name}");
    }
    println!("Output devices:");
    for name in outputs {
        println!("    {name}");
    }
    Ok(())
}

fn report(events: &Receiver<AudioEvent>) {
    for event in events.try_iter() {
        match event {
            AudioEvent::CaptureDropouts(intervals) => {
                for interval in intervals {
                    println!(
                        "Lost input at {:.3}s for {:.3}s",
                        interval.start, interval.duration
                    );
                }
            }
            AudioEvent::StorageFailure(message) => eprintln!("Recording failed: {message}"),
            other => tracing::debug!("{:?}", other),
        }
    }
}

fn play(config: AudioConfig, args: &Args, path: &str, gap: Option<(f64, f64)>) -> Result<()> {
    let track = import_wav(path)?;
    let end = track.end_time();
    let rate = PlayableTrack::rate(&track) as u32;
    let track: Arc<dyn PlayableTrack> = Arc::new(track);

    let (tx, rx) = channel::bounded(256);
    let mut options = StreamOptions::default()
        .with_rate(rate)
        .looped(args.looped)
        .with_speed(args.speed, false)
        .with_listener(ChannelListener::shared(tx));
    if let Some((gap_start, gap_length)) = gap {
        options = options.with_policy(move |_| {
            Box::new(CutPreviewPlaybackPolicy::new(gap_start, gap_length))
        });
    }

    let engine = AudioEngine::new(config, Box::new(CpalBackend::new()));
    engine.start_stream(TransportTracks::playback(vec![track]), 0.0, end, options)?;
    println!("Playing {path} ({end:.2}s)");

    while !engine.poll_completion() {
        report(&rx);
        thread::sleep(Duration::from_millis(100));
    }
    report(&rx);
    let stats = engine.stream_stats();
    if stats.underrun_frames > 0 {
        println!("{} frames arrived late", stats.underrun_frames);
    }
    Ok(())
}

fn record(config: AudioConfig, args: &Args, path: &str, duration: f64) -> Result<()> {
    if !duration.is_finite() || duration <= 0.0 {
        bail!("duration must be positive");
    }
    let rate = config.sample_rate as f64;
    let target = MemoryTrack::new("take", rate, 1).into_shared();

    let mut tracks = TransportTracks::capture(vec![CaptureTrack::new(target.clone())]);
    let mut end = f64::INFINITY;
    if let Some(backing) = &args.play {
        let backing = import_wav(backing)?;
        end = duration.min(backing.end_time());
        tracks.playback.push(Arc::new(backing));
    }

    let (tx, rx) = channel::bounded(256);
    let engine = AudioEngine::new(config, Box::new(CpalBackend::new()));
    engine.start_stream(
        tracks,
        0.0,
        end,
        StreamOptions::default().with_listener(ChannelListener::shared(tx)),
    )?;
    println!("Recording {duration:.1}s to {path}");

    let started = Instant::now();
    while started.elapsed().as_secs_f64() < duration && !engine.poll_completion() {
        report(&rx);
        thread::sleep(Duration::from_millis(100));
    }
    engine.stop_stream();
    report(&rx);

    export_track(path, &target)?;
    println!("Wrote {} frames to {path}", target.len_frames());
    Ok(())
}
