#![allow(clippy::single_match_else, clippy::uninlined_format_args)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::Value;
use survey_cohort_core::Field;
use survey_cohort_store_flatfile::{CATALOG_FILE, MODEL_ARTIFACT_VERSION, MODEL_FILE, RECORD_FILE};
use ulid::Ulid;

fn cohort_binary_path() -> PathBuf {
    match std::env::var("CARGO_BIN_EXE_cohort") {
        Ok(value) => PathBuf::from(value),
        Err(_) => {
            let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../target/debug/cohort");
            if !path.exists() {
                let status = Command::new("cargo")
                    .args(["build", "-p", "survey-cohort-cli", "--bin", "cohort"])
                    .status();
                match status {
                    Ok(value) if value.success() => {}
                    Ok(value) => panic!("failed to build cohort binary (status={value})"),
                    Err(err) => panic!("failed to invoke cargo build: {err}"),
                }
            }
            path
        }
    }
}

fn cohort_output(data_dir: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(cohort_binary_path());
    command.arg("--data-dir").arg(data_dir);
    for arg in args {
        command.arg(arg);
    }

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to execute cohort command {:?}: {err}", args),
    }
}

fn parse_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout json: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

fn artifact_json() -> String {
    let encoding: BTreeMap<&str, Vec<&str>> = Field::ALL
        .iter()
        .map(|field| (field.as_str(), field.domain()))
        .collect();
    let width: usize = Field::ALL.iter().map(|field| field.domain().len()).sum();
    match serde_json::to_string_pretty(&serde_json::json!({
        "artifact_version": MODEL_ARTIFACT_VERSION,
        "cluster_count": 1,
        "encoding": encoding,
        "centroids": [vec![0.0; width]],
    })) {
        Ok(value) => value,
        Err(err) => panic!("failed to serialize artifact fixture: {err}"),
    }
}

fn fixture_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("cohort-snapshot-{tag}-{}", Ulid::new()));
    if let Err(err) = fs::create_dir_all(&dir) {
        panic!("failed to create fixture dir: {err}");
    }

    if let Err(err) = fs::write(dir.join(MODEL_FILE), artifact_json()) {
        panic!("failed to write model fixture: {err}");
    }
    if let Err(err) = fs::write(
        dir.join(CATALOG_FILE),
        r#"{"0": {"name": "Harmoniści", "description": "Szukają równowagi we wszystkim."}}"#,
    ) {
        panic!("failed to write catalog fixture: {err}");
    }

    let table = "age;edu_level;fav_animals;fav_place;gender\n\
                 18-24;Wyższe;Psy;W lesie;Kobieta\n\
                 25-34;Średnie;Koty;Nad wodą;Kobieta\n\
                 35-44;Wyższe;Koty i Psy;W górach;Kobieta\n\
                 unknown;Podstawowe;Brak ulubionych;Inne;Mężczyzna\n";
    if let Err(err) = fs::write(dir.join(RECORD_FILE), table) {
        panic!("failed to write record fixture: {err}");
    }

    dir
}

#[test]
fn snapshot_stats_show_json_v1() {
    let dir = fixture_dir("stats");

    let output = cohort_output(&dir, &["stats", "show", "--cluster", "0"]);
    assert!(
        output.status.success(),
        "stats show failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let snapshot = match serde_json::to_string_pretty(&parse_json(&output)) {
        Ok(value) => value,
        Err(err) => panic!("failed to serialize stats payload: {err}"),
    };

    let expected = r#"{
  "contract_version": "cohort_stats.v1",
  "cluster": 0,
  "name": "Harmoniści",
  "description": "Szukają równowagi we wszystkim.",
  "group_size": 4,
  "total_records": 4,
  "stats": {
    "median_age": {
      "group": "25-34",
      "everyone": "25-34"
    },
    "trait_scores": {
      "group": {
        "younger": 0.5,
        "nature": 0.75,
        "animals": 0.75,
        "higher_education": 0.5,
        "women": 0.75
      },
      "everyone": {
        "younger": 0.5,
        "nature": 0.75,
        "animals": 0.75,
        "higher_education": 0.5,
        "women": 0.75
      }
    },
    "gender": {
      "group": {
        "Kobieta": 75.0,
        "Mężczyzna": 25.0
      },
      "everyone": {
        "Kobieta": 75.0,
        "Mężczyzna": 25.0
      }
    },
    "edu_level": {
      "group": {
        "Podstawowe": 25.0,
        "Wyższe": 50.0,
        "Średnie": 25.0
      },
      "everyone": {
        "Podstawowe": 25.0,
        "Wyższe": 50.0,
        "Średnie": 25.0
      }
    },
    "fav_place": {
      "group": {
        "Inne": 25.0,
        "Nad wodą": 25.0,
        "W górach": 25.0,
        "W lesie": 25.0
      },
      "everyone": {
        "Inne": 25.0,
        "Nad wodą": 25.0,
        "W górach": 25.0,
        "W lesie": 25.0
      }
    }
  }
}"#;

    assert_eq!(snapshot, expected);
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn snapshot_breakdown_json_v1() {
    let dir = fixture_dir("breakdown");

    let output = cohort_output(
        &dir,
        &["stats", "breakdown", "--field", "gender", "--cluster", "0"],
    );
    assert!(
        output.status.success(),
        "breakdown failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let snapshot = match serde_json::to_string_pretty(&parse_json(&output)) {
        Ok(value) => value,
        Err(err) => panic!("failed to serialize breakdown payload: {err}"),
    };

    let expected = r#"{
  "contract_version": "cohort_breakdown.v1",
  "field": "gender",
  "cluster": 0,
  "records": 4,
  "breakdown": {
    "Kobieta": 75.0,
    "Mężczyzna": 25.0
  }
}"#;

    assert_eq!(snapshot, expected);
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn snapshot_unknown_cluster_uses_placeholder_profile_v1() {
    let dir = fixture_dir("placeholder");

    let output = cohort_output(&dir, &["stats", "show", "--cluster", "5"]);
    assert!(output.status.success());

    let payload = parse_json(&output);
    assert_eq!(payload["name"], Value::String("Klaster 5".to_string()));
    assert_eq!(
        payload["description"],
        Value::String("Brak opisu dla tej grupy.".to_string())
    );
    assert_eq!(payload["group_size"], Value::Number(0_u64.into()));
    assert_eq!(
        payload["stats"]["median_age"]["group"],
        Value::String("unknown".to_string())
    );
    assert_eq!(payload["stats"]["trait_scores"]["group"]["women"], serde_json::json!(0.0));
    assert_eq!(payload["stats"]["gender"]["group"], serde_json::json!({}));

    let _ = fs::remove_dir_all(&dir);
}
