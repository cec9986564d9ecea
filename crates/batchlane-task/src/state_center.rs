//! Geographic center of a postal-code CSV
//!
//! Reads the input, averages its `latitude` and `longitude` columns and
//! writes one result line to the output container. Progress goes to the
//! logging container as `boj`, `environment` and `eoj` blobs.

use std::fs;

use serde_json::json;

use batchlane::clock::Clock;

use crate::args::CommonArgs;
use crate::csv::CsvTable;
use crate::error::TaskResult;
use crate::node::{LogData, Sinks, TaskEnv};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Center {
    pub latitude: f64,
    pub longitude: f64,
    pub rows: usize,
}

pub fn center_of(table: &CsvTable) -> TaskResult<Center> {
    Ok(Center {
        latitude: table.mean("latitude")?,
        longitude: table.mean("longitude")?,
        rows: table.rows.len(),
    })
}

/// `results-info-<job>-<task>-<file>`
pub fn results_blob_name(env: &TaskEnv, file_name: &str) -> String {
    format!("results-info-{}-{}-{}", env.job_id, env.task_id, file_name)
}

/// `<job>,<task>,<file>,<lat>,<lng>`
pub fn results_line(env: &TaskEnv, file_name: &str, center: &Center) -> String {
    format!(
        "{},{},{},{},{}",
        env.job_id, env.task_id, file_name, center.latitude, center.longitude
    )
}

/// Run the task. `sinks` is `None` for dry and development runs.
pub fn run(
    args: &CommonArgs,
    dryrun: bool,
    env: &TaskEnv,
    clock: &dyn Clock,
    sinks: Option<&Sinks>,
    vars: impl IntoIterator<Item = (String, String)>,
) -> TaskResult<Option<Center>> {
    let file_name = args.file_name();

    if let Some(sinks) = sinks {
        sinks.logging.put_text(
            &env.log_blob_name("boj", clock.now()),
            &format!("start time is: {}", env.start_epoch()),
        )?;
    }

    let mut log = LogData::new();
    log.set("args.filepath", args.filepath.display().to_string());
    log.set("args.storage_account", args.storage_account.as_str());
    log.set("args.output_container", args.output_container.as_str());
    log.set("args.logging_container", args.logging_container.as_str());
    log.set("args.idx", args.idx);
    log.set("args.dryrun", dryrun);
    log.set("start_epoch", env.start_epoch());
    log.capture_env(vars);

    let env_json = log.to_json()?;
    println!("{}", env_json);

    if dryrun {
        println!("dryrun; not executing task logic.  task complete.");
        return Ok(None);
    }
    if let Some(sinks) = sinks {
        sinks
            .logging
            .put_text(&env.log_blob_name("environment", clock.now()), &env_json)?;
    }

    let input = fs::canonicalize(&args.filepath).unwrap_or_else(|_| args.filepath.clone());
    let results_name = results_blob_name(env, &file_name);
    log.set("fq_input_file", input.display().to_string());
    log.set("results_csv_filename", results_name.as_str());

    let table = CsvTable::parse(&fs::read_to_string(&args.filepath)?)?;
    let center = center_of(&table)?;
    let line = results_line(env, &file_name, &center);
    println!("{}", line);
    tracing::info!(file = %file_name, rows = center.rows, "computed center");

    match sinks {
        Some(sinks) => {
            log.set("env", "remote");
            log.set("result", json!({ "latitude": center.latitude, "longitude": center.longitude }));
            sinks.output.put_text(&results_name, &line)?;
            sinks
                .logging
                .put_text(&env.log_blob_name("eoj", clock.now()), &log.to_json()?)?;
        }
        None => println!("dev mode; no result blob processing"),
    }
    Ok(Some(center))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{self, Harness};
    use chrono::DateTime;

    const CT: &str = "id,postal_cd,country_cd,city_name,state_abbrv,latitude,longitude\n\
1,06001,US,Avon,CT,41.0,-72.0\n\
2,06002,US,Bloomfield,CT,42.0,-73.0\n";

    #[test]
    fn test_results_line_and_name() {
        let env = TaskEnv {
            job_id: "states-1".to_string(),
            task_id: "task0".to_string(),
            started_at: DateTime::from_timestamp(0, 0).unwrap(),
        };
        let center = Center {
            latitude: 41.5,
            longitude: -72.5,
            rows: 2,
        };
        assert_eq!(
            results_blob_name(&env, "postal_codes_ct.csv"),
            "results-info-states-1-task0-postal_codes_ct.csv"
        );
        assert_eq!(
            results_line(&env, "postal_codes_ct.csv", &center),
            "states-1,task0,postal_codes_ct.csv,41.5,-72.5"
        );
    }

    #[test]
    fn test_run_writes_result_and_logs() {
        let h = Harness::new();
        let input = h.write_input("postal_codes_ct.csv", CT);
        let args = h.args(&input);

        let center = run(&args, false, &h.env, h.clock.as_ref(), Some(&h.sinks(&args)), Vec::new())
            .unwrap()
            .unwrap();
        assert_eq!(center.latitude, 41.5);
        assert_eq!(center.longitude, -72.5);

        let result = h
            .store
            .get_blob_to_text("out", "results-info-states-1-task0-postal_codes_ct.csv")
            .unwrap();
        assert_eq!(result, "states-1,task0,postal_codes_ct.csv,41.5,-72.5");

        let logs: Vec<String> = h
            .store
            .list_blobs("log")
            .unwrap()
            .into_iter()
            .map(|b| b.name)
            .collect();
        for kind in ["boj", "environment", "eoj"] {
            assert!(
                logs.iter().any(|n| n.contains(&format!("-{}-", kind))),
                "missing {} log in {:?}",
                kind,
                logs
            );
        }
    }

    #[test]
    fn test_dryrun_skips_everything() {
        let h = Harness::new();
        let args = h.args(&h.dir.path().join("absent.csv"));
        let center = run(&args, true, &h.env, h.clock.as_ref(), None, Vec::new()).unwrap();
        assert_eq!(center, None);
        assert!(h.store.list_blobs("out").unwrap().is_empty());
    }

    #[test]
    fn test_dev_mode_computes_without_writing() {
        let h = Harness::new();
        let input = h.write_input("postal_codes_ct.csv", CT);
        let args = testutil::dev(h.args(&input));
        let center = run(&args, false, &h.env, h.clock.as_ref(), None, Vec::new()).unwrap();
        assert!(center.is_some());
        assert!(h.store.list_blobs("out").unwrap().is_empty());
        assert!(h.store.list_blobs("log").unwrap().is_empty());
    }

    #[test]
    fn test_bad_input_fails() {
        let h = Harness::new();
        let input = h.write_input("bad.csv", "id,latitude\n1,41.0\n");
        let args = h.args(&input);
        let err = run(&args, false, &h.env, h.clock.as_ref(), Some(&h.sinks(&args)), Vec::new())
            .unwrap_err();
        assert!(err.to_string().contains("longitude"));
    }
}
