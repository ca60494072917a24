use std::process::Command;

use tempfile::tempdir;

fn friction() -> Command {
    Command::new(env!("CARGO_BIN_EXE_friction"))
}

#[test]
fn cli_synth_analyze_and_compare() {
    let dir = tempdir().unwrap();
    let events = dir.path().join("events.jsonl");
    let out_dir = dir.path().join("out");
    let config = dir.path().join("config.json");
    std::fs::write(
        &config,
        r#"{"cluster_k": 4, "min_cluster_population": 10, "min_actor_cluster_samples": 10, "min_test_samples": 10}"#,
    )
    .unwrap();

    let status = friction()
        .args(["synth", "--case", "small_untimed"])
        .arg("--out")
        .arg(&events)
        .status()
        .unwrap();
    assert!(status.success());
    assert_eq!(std::fs::read_to_string(&events).unwrap().lines().count(), 480);

    let status = friction()
        .arg("analyze")
        .arg("--events")
        .arg(&events)
        .arg("--out-dir")
        .arg(&out_dir)
        .arg("--config")
        .arg(&config)
        .status()
        .unwrap();
    assert!(status.success());
    for file in [
        "friction_records.jsonl",
        "firmware_profiles.jsonl",
        "trajectories.jsonl",
        "tests.jsonl",
        "analysis.json",
    ] {
        assert!(out_dir.join(file).exists(), "missing {file}");
    }

    let output = friction()
        .arg("compare")
        .arg("--profiles")
        .arg(out_dir.join("firmware_profiles.jsonl"))
        .args(["--actor-a", "actor_000", "--actor-b", "actor_001", "--period", "0"])
        .args(["--skill-band", "1000"])
        .arg("--config")
        .arg(&config)
        .output()
        .unwrap();
    assert!(output.status.success());
    let v: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(v.get("actor_a").and_then(|a| a.as_str()), Some("actor_000"));
    assert!(v.get("divergent").and_then(|d| d.as_array()).is_some());
}

#[test]
fn cli_synth_is_deterministic() {
    let dir = tempdir().unwrap();
    let a = dir.path().join("a.jsonl");
    let b = dir.path().join("b.jsonl");
    for path in [&a, &b] {
        let status = friction()
            .args(["synth", "--case", "blitz_pressure", "--actors", "2", "--seed", "7"])
            .arg("--out")
            .arg(path)
            .status()
            .unwrap();
        assert!(status.success());
    }
    assert_eq!(
        std::fs::read_to_string(&a).unwrap(),
        std::fs::read_to_string(&b).unwrap()
    );
}

#[test]
fn cli_cache_prune_requires_a_limit() {
    let dir = tempdir().unwrap();
    let status = friction()
        .arg("cache-prune")
        .arg("--db")
        .arg(dir.path().join("cache.sqlite"))
        .status()
        .unwrap();
    assert!(!status.success());
}

#[test]
fn cli_unknown_case_fails() {
    let dir = tempdir().unwrap();
    let status = friction()
        .args(["synth", "--case", "no_such_case"])
        .arg("--out")
        .arg(dir.path().join("x.jsonl"))
        .status()
        .unwrap();
    assert!(!status.success());
}
