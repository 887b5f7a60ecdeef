#[test]
fn webground_version_contract() {
    let bin = assert_cmd::cargo::cargo_bin!("webground");
    let out = std::process::Command::new(bin)
        .args(["version"])
        .env_remove("WEBGROUND_ENV_FILE")
        .output()
        .expect("run webground version");

    assert!(out.status.success(), "webground version failed");
    let s = String::from_utf8_lossy(&out.stdout);
    let v: serde_json::Value = serde_json::from_str(&s).expect("parse version json");

    assert_eq!(v["schema_version"].as_u64(), Some(1));
    assert_eq!(v["name"].as_str(), Some("webground"));
    assert!(!v["version"].as_str().unwrap_or("").is_empty());
}

#[test]
fn webground_doctor_reports_without_secrets() {
    let bin = assert_cmd::cargo::cargo_bin!("webground");
    let tmp = tempfile::tempdir().expect("tempdir");
    let out = std::process::Command::new(bin)
        .args(["doctor", "--check-node=false"])
        .env("WEBGROUND_CACHE", "fs")
        .env("WEBGROUND_CACHE_DIR", tmp.path())
        .env("WEBGROUND_LLM_API_KEY", "gsk_do_not_print")
        .env_remove("WEBGROUND_ENV_FILE")
        .env_remove("WEBGROUND_LLM_PROVIDER")
        .output()
        .expect("run webground doctor");

    assert!(out.status.success(), "webground doctor failed");
    let s = String::from_utf8_lossy(&out.stdout);
    assert!(!s.contains("gsk_do_not_print"));
    let v: serde_json::Value = serde_json::from_str(&s).expect("parse doctor json");
    assert_eq!(v["kind"].as_str(), Some("doctor"));
    assert_eq!(v["configured"]["llm_api_key_present"].as_bool(), Some(true));
    assert_eq!(v["configured"]["cache"].as_str(), Some("fs"));

    let checks = v["checks"].as_array().expect("checks array");
    let find = |name: &str| {
        checks
            .iter()
            .find(|c| c["name"].as_str() == Some(name))
            .unwrap_or_else(|| panic!("missing check {name}"))
    };
    assert_eq!(find("cache_dir_writable")["ok"].as_bool(), Some(true));
    assert_eq!(find("node_launch")["skipped"].as_bool(), Some(true));
    assert_eq!(find("llm_credentials")["ok"].as_bool(), Some(true));
}
