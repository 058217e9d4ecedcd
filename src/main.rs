use std::io;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use minismu::{
    CURRENT_RANGE_LIMITS, CurrentRange, Mode, SessionConfig, Smu, StreamStats, SweepConfig,
    SweepOptions, SweepReport,
};
use tracing::info;

mod cli;
mod logging;

fn main() -> Result<()> {
    let args = cli::Cli::parse();
    logging::init(args.log_format, args.log_level);

    let config = SessionConfig::default().with_timeout(Duration::from_millis(args.timeout_ms));
    let smu = Smu::open_with(args.conn.clone(), config)
        .with_context(|| format!("connecting to {}", args.conn))?;

    match args.cmd {
        cli::Cmd::Idn => println!("{}", smu.identity().context("identity query")?),
        cli::Cmd::Temps => {
            let t = smu.temperatures().context("temperature query")?;
            println!("adc={:.2}C ch1={:.2}C ch2={:.2}C", t.adc, t.channel1, t.channel2);
        }
        cli::Cmd::Measure(opts) => measure(&smu, opts)?,
        cli::Cmd::Sweep(opts) => sweep(&smu, opts)?,
        cli::Cmd::Stream(opts) => stream(&smu, opts)?,
        cli::Cmd::Ranges(opts) => ranges(&smu, opts)?,
        cli::Cmd::Fourwire { state } => {
            match state {
                Some(t) if t.is_on() => smu.enable_fourwire_mode(),
                Some(_) => smu.disable_fourwire_mode(),
                None => Ok(()),
            }
            .context("switching four-wire mode")?;
            let on = smu.fourwire_mode().context("four-wire query")?;
            println!("four-wire: {}", if on { "on" } else { "off" });
        }
        cli::Cmd::Wifi { autoconnect } => {
            if let Some(t) = autoconnect {
                smu.set_wifi_autoconnect(t.is_on())
                    .context("setting wifi autoconnect")?;
            }
            let w = smu.wifi_status().context("wifi status")?;
            match (w.connected, w.ssid, w.ip_address, w.rssi) {
                (true, Some(ssid), Some(ip), Some(rssi)) => {
                    println!("connected to {ssid} as {ip} ({rssi} dBm)")
                }
                _ => println!("not connected"),
            }
            println!("autoconnect: {}", smu.wifi_autoconnect()?);
        }
        cli::Cmd::SyncTime => smu.sync_time().context("setting device clock")?,
    }
    smu.close();
    Ok(())
}

fn measure(smu: &Smu, opts: cli::MeasureOpts) -> Result<()> {
    if let Some(osr) = opts.osr {
        smu.set_oversampling_ratio(opts.ch, osr)?;
    }
    if let Some(v) = opts.volts {
        smu.set_mode(opts.ch, Mode::ForceVoltageMeasureCurrent)?;
        smu.set_voltage(opts.ch, v)
            .with_context(|| format!("forcing {v} V on channel {}", opts.ch))?;
        smu.enable_channel(opts.ch)?;
    }
    let m = smu.measure_voltage_and_current(opts.ch)?;
    println!("{:.6} V, {:e} A", m.voltage, m.current);
    Ok(())
}

fn sweep(smu: &Smu, opts: cli::SweepOpts) -> Result<()> {
    let config = SweepConfig::new(opts.start, opts.end, opts.points, opts.dwell_ms)
        .with_auto_enable(!opts.manual_output);
    let options = SweepOptions {
        poll_interval: Duration::from_millis(opts.poll_ms),
        ..SweepOptions::for_config(&config)
    };
    smu.set_mode(opts.ch, Mode::ForceVoltageMeasureCurrent)?;
    let result = smu
        .run_iv_sweep(opts.ch, config, options, |s| {
            info!(
                point = s.current_point,
                total = s.total_points,
                remaining_ms = s.estimated_remaining_ms,
                "sweep {:.0}%",
                s.progress() * 100.0
            );
        })
        .context("running sweep")?;
    if !result.is_complete() {
        eprintln!(
            "sweep {}; {} of {} points collected",
            result.phase,
            result.data.len(),
            result.config.points
        );
    }
    if opts.json {
        let report = SweepReport {
            config: result.config,
            data: result.data,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        // header row comes from the SweepDataPoint field names
        let mut out = csv::Writer::from_writer(io::stdout());
        for p in &result.data {
            out.serialize(p)?;
        }
        out.flush()?;
    }
    Ok(())
}

fn stream(smu: &Smu, opts: cli::StreamOpts) -> Result<()> {
    if let Some(hz) = opts.rate {
        smu.set_sample_rate(opts.ch, hz)?;
    }
    let interval = Duration::from_secs_f64(opts.stats.max(0.1));
    let mut stats = StreamStats::new();
    let mut out = csv::Writer::from_writer(io::stdout());
    out.write_record(["timestamp", "voltage", "current"])?;
    let mut session = smu.stream(opts.ch).context("starting stream")?;
    while (stats.total() as usize) < opts.samples {
        let s = session.next_sample().context("reading stream")?;
        stats.record(&s);
        out.write_record([
            s.timestamp.to_string(),
            format!("{:.6}", s.voltage),
            format!("{:e}", s.current),
        ])?;
        stats.maybe_log(interval);
    }
    session.finish().context("stopping stream")?;
    out.flush()?;
    if let Some(rate) = stats.device_rate(opts.ch) {
        info!(samples = stats.total(), gaps = stats.gaps, "{rate:.1} samples/s");
    }
    Ok(())
}

fn ranges(smu: &Smu, opts: cli::RangeOpts) -> Result<()> {
    match opts.expect {
        Some(amps) => {
            if !amps.is_finite() {
                bail!("expected current must be finite");
            }
            let range = smu.set_current_range_by_limit(opts.ch, amps)?;
            println!("channel {}: range {range}", opts.ch);
        }
        None => {
            for i in 0..CURRENT_RANGE_LIMITS.len() {
                println!("{}", CurrentRange::new(i)?);
            }
            let active = smu.current_range(opts.ch)?;
            let auto = smu.autorange(opts.ch)?;
            println!(
                "channel {}: range {}{}",
                opts.ch,
                active.index(),
                if auto { " (auto)" } else { "" }
            );
        }
    }
    Ok(())
}
