use clap::{Arg, Command, value_parser};
use smu_stream::{Event, Mode, Quantity, Session};
use status_line::StatusLine;
use std::{
    error::Error,
    fmt::Display,
    fs::File,
    io::{BufWriter, Write},
    path::PathBuf,
    process::exit,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

fn parse_mode(name: &str) -> Mode {
    match name {
        "svmi" => Mode::Svmi,
        "simv" => Mode::Simv,
        _ => Mode::Disabled,
    }
}

fn cli() -> Command {
    Command::new("smu-capture")
        .about("Stream measurements from a source-measure unit to CSV")
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .value_parser(value_parser!(PathBuf))
                .default_value("capture.csv")
                .help("Output file"),
        )
        .arg(
            Arg::new("serial")
                .long("serial")
                .value_parser(value_parser!(String))
                .help("Serial number of the device to use, the first one found by default"),
        )
        .arg(
            Arg::new("samplerate")
                .short('s')
                .long("samplerate")
                .value_parser(value_parser!(u32))
                .default_value("0")
                .help("Sample rate in samples per second, 0 for the device default"),
        )
        .arg(
            Arg::new("samples")
                .short('n')
                .long("samples")
                .value_parser(value_parser!(u64))
                .default_value("0")
                .help("Samples per channel, 0 to capture until interrupted"),
        )
        .arg(
            Arg::new("mode-a")
                .long("mode-a")
                .value_parser(["disabled", "svmi", "simv"])
                .default_value("disabled")
                .help("Channel A mode"),
        )
        .arg(
            Arg::new("value-a")
                .long("value-a")
                .value_parser(value_parser!(f32))
                .default_value("0")
                .allow_negative_numbers(true)
                .help("Constant sourced on channel A, in V or A"),
        )
        .arg(
            Arg::new("mode-b")
                .long("mode-b")
                .value_parser(["disabled", "svmi", "simv"])
                .default_value("disabled")
                .help("Channel B mode"),
        )
        .arg(
            Arg::new("value-b")
                .long("value-b")
                .value_parser(value_parser!(f32))
                .default_value("0")
                .allow_negative_numbers(true)
                .help("Constant sourced on channel B, in V or A"),
        )
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let matches = cli().get_matches();

    let output = matches.get_one::<PathBuf>("output").unwrap();
    let rate = *matches.get_one::<u32>("samplerate").unwrap();
    let samples = *matches.get_one::<u64>("samples").unwrap();

    let session = Session::new()?;
    if session.scan()? == 0 {
        return Err("no supported devices found".into());
    }
    let serial = match matches.get_one::<String>("serial") {
        Some(serial) => serial.clone(),
        None => session
            .available()
            .into_iter()
            .next()
            .map(|d| d.serial)
            .ok_or("no supported devices found")?,
    };
    let device = session.add(&serial)?;

    for (channel, (mode, value)) in [("mode-a", "value-a"), ("mode-b", "value-b")]
        .into_iter()
        .enumerate()
    {
        let mode = parse_mode(matches.get_one::<String>(mode).unwrap());
        let value = *matches.get_one::<f32>(value).unwrap();
        device.set_mode(channel, mode)?;
        let sourced = match mode {
            Mode::Simv => Quantity::Current,
            _ => Quantity::Voltage,
        };
        device.with_signal(channel, sourced, |s| s.source_constant(value))?;
    }
    let rate = session.configure(rate)?;

    #[derive(Clone)]
    struct Progress {
        written: Arc<AtomicU64>,
        sample_rate: f64,
    }
    impl Display for Progress {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            let written = self.written.load(Ordering::Relaxed);
            write!(
                f,
                "Written: {} ({:.02}s)",
                written,
                written as f64 / self.sample_rate
            )
        }
    }

    let progress = Progress {
        written: Arc::new(AtomicU64::new(0)),
        sample_rate: rate as f64,
    };
    let status = StatusLine::new(progress.clone());

    let stop = Arc::new(AtomicBool::new(false));
    let stop_clone = stop.clone();
    ctrlc::set_handler(move || {
        if stop_clone.load(Ordering::Relaxed) {
            eprintln!("Killing...");
            exit(-1);
        }
        stop_clone.store(true, Ordering::Relaxed);
    })?;

    let mut out = BufWriter::new(File::create(output)?);
    writeln!(
        out,
        "# {} hardware {} firmware {}, {} sps, {}",
        device.serial(),
        device.hw_version(),
        device.fw_version(),
        rate,
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    )?;
    writeln!(out, "t,va,ia,vb,ib")?;

    let events = session.subscribe();
    session.start(samples)?;

    let mut n: u64 = 0;
    let mut finished = false;
    let mut cancelled = false;
    loop {
        if stop.load(Ordering::Relaxed) && !cancelled {
            session.cancel();
            cancelled = true;
        }
        if events
            .try_iter()
            .any(|e| matches!(e, Event::Completion { .. }))
        {
            finished = true;
        }
        match device.read(4096, Some(Duration::from_millis(50))) {
            Ok(batch) => {
                for [va, ia, vb, ib] in batch {
                    writeln!(
                        out,
                        "{:.9},{},{},{},{}",
                        n as f64 / rate as f64,
                        va,
                        ia,
                        vb,
                        ib
                    )?;
                    n += 1;
                }
                progress.written.store(n, Ordering::Relaxed);
            }
            Err(smu_stream::Error::Overflow) => log::warn!("samples dropped, output too slow"),
            Err(e) => return Err(e.into()),
        }
        if finished && device.queued() == 0 {
            break;
        }
    }
    out.flush()?;
    drop(status);
    session.end()?;
    if device.overcurrent() {
        eprintln!("Overcurrent detected during capture");
    }
    eprintln!("{}", progress);
    eprintln!("Done!");

    Ok(())
}
