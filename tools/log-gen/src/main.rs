//! log-gen: synthetic formulation-line alarm logs
//!
//! Usage:
//!   log-gen                                   # 30 days from 2025-10-05 into logs_formulation/
//!   log-gen --days 7 --start 2025-11-01 --out /tmp/logs --seed 7
//!
//! Writes one `<YYYY-MM-DD>_formulacao.log` per day. Each day holds 15-35
//! alarm sequences (raise, optional message, acknowledgement, six batch-log
//! lines, resolve) with normal tag logs and watchdog ticks between them.
//! The same seed always produces the same files.

use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use chrono::{Duration, NaiveDate, NaiveDateTime};
use clap::Parser;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

const COMPONENTS: &[&str] = &["PC510A00", "PC510A01", "PC520A00", "PC520A01", "PC530A00"];

const OPERATORS: &[&str] = &["FORM", "DOSM", "MIXR", "PREP", "CTRL", "QUAL"];

const ALARMS: &[(&str, &str)] = &[
    ("FMDOS01", "Erro dosagem ingrediente principal"),
    ("FMTMP01", "Temperatura fora de especificação"),
    ("FMPRS01", "Pressão do sistema inadequada"),
    ("FMMIX01", "Erro misturador batch"),
    ("FMTNK01", "Nível baixo tanque ingrediente A"),
    ("FMTNK02", "Nível baixo tanque ingrediente B"),
    ("FMVLV01", "Erro válvula dosadora"),
    ("FMBMP01", "Erro bomba de transferência"),
    ("FMPH001", "pH fora de especificação"),
    ("FMVSC01", "Viscosidade fora de especificação"),
    ("FMAGT01", "Erro agitador principal"),
    ("FMSNS01", "Falha sensor de temperatura"),
    ("FMSNS02", "Falha sensor de pressão"),
    ("FMPES01", "Erro pesagem ingrediente"),
    ("FMTIM01", "Tempo de mistura excedido"),
    ("FMHEAT1", "Erro sistema de aquecimento"),
    ("FMCOOL1", "Erro sistema de resfriamento"),
    ("FMCONT1", "Contaminação detectada"),
    ("FMFLT01", "Erro filtro de linha"),
    ("FMDOS02", "Erro bomba dosadora"),
];

const TAGS: &[&str] = &[
    "IX_BATCH_LOGDATA_1A.A_CV",
    "IX_BATCH_LOGDATA_1B.A_CV",
    "IX_BATCH_LOGDATA_1C.A_CV",
    "IX_BATCH_LOGDATA_1D.A_CV",
    "IX_BATCH_LOGDATA_01.F_CV",
    "IX_BATCH_LOGDATA_03.F_CV",
    "IX_BATCH_START_INIT.A_CV",
    "IX_BATCH_START_TID.A_CV",
    "IX_BATCH_STOP_TID.A_CV",
    "IX_BATCHNR.A_CV",
    "IX_VARE_NR.A_CV",
    "IX_TEMP_SETPOINT.F_CV",
    "IX_PRESS_ACTUAL.F_CV",
    "IX_DOSE_WEIGHT.F_CV",
    "IX_MIX_SPEED.F_CV",
    "IX_OPERAT1.A_DESC",
    "IX_OPERAT2.A_DESC",
    "IX_OPERNAVN1.A_DESC",
    "IX_OPERNAVN2.A_DESC",
    "IX_ANTALOPE.F_CV",
];

const PRODUCTS: &[&str] = &[
    "Insulin Aspart FormBase 100",
    "Insulin Detemir FormMix 200",
    "Insulin Degludec FormPlus 150",
    "Biphasic Insulin FormStd 75",
    "Insulin Glargine FormAdv 125",
];

const WATCHDOG_COUNTER: i64 = -2147220484;

#[derive(Debug, Parser)]
#[command(name = "log-gen", about = "Synthetic formulation-line alarm logs")]
struct Args {
    /// Number of consecutive daily files.
    #[arg(long, default_value_t = 30)]
    days: u32,
    /// First day, YYYY-MM-DD.
    #[arg(long, default_value = "2025-10-05", value_parser = parse_date)]
    start: NaiveDate,
    #[arg(long, default_value = "logs_formulation")]
    out: PathBuf,
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

fn parse_date(s: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| format!("{}: {}", s, e))
}

/// Wall clock of the day being written; only ever moves forward.
struct Clock {
    now: NaiveDateTime,
}

impl Clock {
    fn advance(&mut self, rng: &mut StdRng, min_secs: i64, max_secs: i64) {
        self.now += Duration::seconds(rng.gen_range(min_secs..=max_secs));
    }

    /// `YYYY-MM-DD HH:MM:SS,d`, one random sub-second digit.
    fn stamp(&self, rng: &mut StdRng) -> String {
        format!("{},{}", self.now.format("%Y-%m-%d %H:%M:%S"), rng.gen_range(0..10))
    }
}

fn pick<'a>(rng: &mut StdRng, items: &[&'a str]) -> &'a str {
    items.choose(rng).copied().unwrap_or_default()
}

fn alarm_sequence(rng: &mut StdRng, clock: &mut Clock, lines: &mut Vec<String>) {
    let (code, desc) = ALARMS.choose(rng).copied().unwrap_or(ALARMS[0]);
    let operator = pick(rng, OPERATORS);
    let pc = pick(rng, COMPONENTS);
    let others: Vec<&str> = COMPONENTS.iter().copied().filter(|c| *c != pc).collect();
    let dest = pick(rng, &others);

    let status = if rng.gen_bool(0.5) { "CFN" } else { "ALARM" };
    lines.push(format!(
        "{} [{}] {:<30} {:<15} {:<10} {}",
        clock.stamp(rng),
        pc,
        code,
        status,
        "ALARM",
        desc
    ));

    if rng.gen_bool(0.6) {
        clock.advance(rng, 1, 5);
        lines.push(format!("{} [{}] {:<30} {:<15} {:<10} {}", clock.stamp(rng), pc, code, "CFN", "MSG.", desc));
    }

    clock.advance(rng, 5, 120);
    lines.push(format!(
        "{} [{}] {} ALARM is acknowledged by {}::{:<30} ACK",
        clock.stamp(rng),
        pc,
        code,
        dest,
        operator
    ));

    let batch = [
        ("IX_BATCH_LOGDATA_01.F_CV", "250"),
        ("IX_BATCH_LOGDATA_1A.A_CV", "EVENT"),
        ("IX_BATCH_LOGDATA_1B.A_CV", operator),
        ("IX_BATCH_LOGDATA_1C.A_CV", "Reconhecido alm./msg. selecionado:"),
        ("IX_BATCH_LOGDATA_1D.A_CV", ""),
        ("IX_BATCH_LOGDATA_01.F_CV", "2"),
    ];
    for (tag, value) in batch {
        clock.advance(rng, 1, 1);
        // The panel truncates the operator on the 1C line.
        let by_operator = if tag.contains("1C") { &operator[..3] } else { operator };
        lines.push(format!(
            "{} [{}] Pix32.{}.{} set to {} by {}::{}",
            clock.stamp(rng),
            pc,
            pc,
            tag,
            value,
            dest,
            by_operator
        ));
    }

    clock.advance(rng, 30, 300);
    lines.push(format!("{} [{}] {:<30} {:<15} {:<10} {}", clock.stamp(rng), pc, code, "OK", "A_OK", desc));
}

fn tag_value(rng: &mut StdRng, tag: &str, operator: &str, stamp: &str) -> String {
    if tag.contains("F_CV") {
        format!("{:.1}", rng.gen_range(0.0..250.0))
    } else if tag.contains("BATCHNR") {
        format!("FORM{}BT{}", rng.gen_range(1000..=9999), rng.gen_range(10..=99))
    } else if tag.contains("VARE_NR") {
        pick(rng, PRODUCTS).to_string()
    } else if tag.contains("1A.A_CV") {
        pick(rng, &["EVENT", "COUNTERSTAT", "ANNOUNCE"]).to_string()
    } else if tag.contains("1B.A_CV") || tag.contains("DESC") {
        operator.to_string()
    } else if tag.contains("1C.A_CV") {
        let (_, desc) = ALARMS.choose(rng).copied().unwrap_or(ALARMS[0]);
        desc.chars().take(40).collect()
    } else if tag.contains("1D.A_CV") {
        pick(rng, &["Ativo", "Inativo", ""]).to_string()
    } else if tag.contains("TID") {
        stamp.to_string()
    } else {
        rng.gen_range(0..=2).to_string()
    }
}

fn filler_line(rng: &mut StdRng, clock: &Clock) -> String {
    let component = pick(rng, COMPONENTS);
    let stamp = clock.stamp(rng);
    if rng.gen_bool(0.7) {
        let tag = pick(rng, TAGS);
        let operator = pick(rng, OPERATORS);
        let value = tag_value(rng, tag, operator, &stamp);
        format!("{} [{}] Pix32.{}.{} set to {} by {}::{}", stamp, component, component, tag, value, component, operator)
    } else {
        format!("{} [{}] {}: FORM_Background_Schedule_WDG by {}", stamp, component, WATCHDOG_COUNTER, component)
    }
}

fn day_lines(rng: &mut StdRng, date: NaiveDate) -> Vec<String> {
    let start = date
        .and_hms_opt(rng.gen_range(6..=8), rng.gen_range(0..60), rng.gen_range(0..60))
        .unwrap_or_default();
    let mut clock = Clock { now: start };
    let mut lines = Vec::new();

    for _ in 0..rng.gen_range(15..=35) {
        alarm_sequence(rng, &mut clock, &mut lines);
        for _ in 0..rng.gen_range(5..=15) {
            clock.advance(rng, 15, 45);
            lines.push(filler_line(rng, &clock));
        }
    }
    lines
}

fn file_name(date: NaiveDate) -> String {
    format!("{}_formulacao.log", date.format("%Y-%m-%d"))
}

fn generate(out: &Path, start: NaiveDate, days: u32, seed: u64) -> std::io::Result<Vec<(PathBuf, usize)>> {
    fs::create_dir_all(out)?;
    let mut rng = StdRng::seed_from_u64(seed);
    let mut written = Vec::new();
    for offset in 0..days {
        let date = start + Duration::days(i64::from(offset));
        let lines = day_lines(&mut rng, date);
        let path = out.join(file_name(date));
        fs::write(&path, lines.join("\n") + "\n")?;
        written.push((path, lines.len()));
    }
    Ok(written)
}

fn main() {
    let args = Args::parse();

    let written = generate(&args.out, args.start, args.days, args.seed).unwrap_or_else(|e| {
        eprintln!("log-gen: cannot write to {}: {}", args.out.display(), e);
        process::exit(2);
    });

    for (i, (path, count)) in written.iter().enumerate() {
        println!("[{:2}/{}] {} ({} lines)", i + 1, written.len(), path.display(), count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alarm_etl::classify::classify_text;
    use alarm_etl::correlate::correlate;
    use alarm_etl::types::{ClassifiedRecord, LifecycleState};

    fn sample_day(seed: u64) -> Vec<String> {
        let mut rng = StdRng::seed_from_u64(seed);
        day_lines(&mut rng, NaiveDate::from_ymd_opt(2025, 10, 5).unwrap())
    }

    #[test]
    fn same_seed_same_day() {
        assert_eq!(sample_day(7), sample_day(7));
        assert_ne!(sample_day(7), sample_day(8));
    }

    #[test]
    fn every_generated_line_is_recognized() {
        for (i, line) in sample_day(3).iter().enumerate() {
            let record = classify_text(i as u32 + 1, line);
            assert!(
                !matches!(record, ClassifiedRecord::Unrecognized { .. }),
                "line {} not recognized: {:?} ({:?})",
                i + 1,
                line,
                record
            );
        }
    }

    #[test]
    fn generated_day_correlates_cleanly() {
        let lines = sample_day(11);
        let records = lines
            .iter()
            .enumerate()
            .map(|(i, l)| classify_text(i as u32 + 1, l));
        let out = correlate("2025-10-05_formulacao.log", records).unwrap();

        assert!((15..=35).contains(&out.lifecycles.len()));
        assert!(out.orphans.is_empty());
        for lc in &out.lifecycles {
            assert_eq!(lc.state, LifecycleState::Closed);
            assert!(lc.ack.is_some());
            assert_eq!(lc.annotations.len(), 6);
        }
    }

    #[test]
    fn writes_one_named_file_per_day() {
        let tmp = tempfile::tempdir().unwrap();
        let start = NaiveDate::from_ymd_opt(2025, 10, 30).unwrap();
        let written = generate(tmp.path(), start, 3, 1).unwrap();

        let names: Vec<String> = written
            .iter()
            .map(|(p, _)| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            vec!["2025-10-30_formulacao.log", "2025-10-31_formulacao.log", "2025-11-01_formulacao.log"]
        );
        let body = fs::read_to_string(&written[0].0).unwrap();
        assert_eq!(body.lines().count(), written[0].1);
    }
}
