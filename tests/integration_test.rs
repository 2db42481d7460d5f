use rusqlite::Connection;
use serde_json::{json, Value};
use station_rca::analysis::NoProgress;
use station_rca::config::AppConfig;
use station_rca::datasource::SqliteSource;
use station_rca::observability::LogBuffer;
use station_rca::rule_document::RuleDocument;
use station_rca::rule_tree::RuleParseOptions;
use station_rca::session::{auto_run, Session};
use station_rca::troubleshooting::TroubleshootingGuide;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

/// Station database with one week of records, a Manual unit and one unit past the window.
fn create_station_db(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        r#"
        CREATE TABLE "ST10" ("Serial" TEXT, "Leak" INTEGER, "Seal" TEXT, "State" TEXT, "Date_Time" TEXT, "Result" TEXT);
        INSERT INTO "ST10" VALUES ('U1', 1, 'OK',  'Auto',   '2024-04-24 10:00:00', 'OK');
        INSERT INTO "ST10" VALUES ('U2', 0, 'NG',  'Auto',   '2024-04-25 10:00:00', 'NG');
        INSERT INTO "ST10" VALUES ('U3', 0, 'OK',  'Auto',   '2024-04-26 10:00:00', 'NG');
        INSERT INTO "ST10" VALUES ('U4', 0, 'OK',  'Manual', '2024-04-26 11:00:00', 'NG');
        INSERT INTO "ST10" VALUES ('U5', 1, 'OK',  'Auto',   '2024-05-02 10:00:00', 'OK');

        CREATE TABLE "ST20" ("Serial" TEXT, " Torque " TEXT, "State" TEXT, "Date_Time" TEXT, "Result" TEXT);
        INSERT INTO "ST20" VALUES ('U1', 'PASS', 'Auto', '2024-04-24 11:00:00', 'OK');
        INSERT INTO "ST20" VALUES ('U6', '-1  ', 'Auto', '2024-04-27 09:00:00', 'OK');
        INSERT INTO "ST20" VALUES ('U7', '?',    'Auto', '2024-04-28 09:00:00', 'NG');
        "#,
    )?;
    Ok(())
}

fn rules() -> Value {
    json!({
        "ST10": {"models": {
            "Housing-A": {"rules": [{
                "feature": "Leak",
                "pass": {"Prediction": "OK"},
                "fail": {
                    "feature": "Seal",
                    "fail": {"Prediction": "NG", "root_cause": "Seal damaged"},
                    "pass": {"Prediction": "NG", "root_cause": "Leak"}
                }
            }]},
            "Housing-B": {"rules": [{"Prediction": "OK"}]}
        }},
        "ST20": {"models": {"Housing-A": {"rules": [{
            "feature": "Torque",
            "fail": {"Prediction": "NG"},
            "Disable": {"Prediction": "OK"},
            "pass": {"Prediction": "OK"}
        }]}}}
    })
}

fn troubleshooting() -> Value {
    json!({
        "ST10": {
            "Leak": [{"Possible Problem": "Test plug worn", "Solution": "Replace plug"}],
            "Seal damaged": [{"Possible Problem": "Seal pinched", "Solution": "Check press"}]
        }
    })
}

#[tokio::test]
async fn test_auto_run_writes_report_and_advances_date() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let db_path = dir.path().join("stations.db");
    create_station_db(&db_path)?;

    let config_path = dir.path().join("app_config.json");
    let mut config = AppConfig {
        database: db_path.display().to_string(),
        auto_save_path: dir.path().display().to_string(),
        html_filename: "Line3".to_string(),
        html_title: "Line 3".to_string(),
        include_week_no: true,
        date_setup: Some("2024/05/01".to_string()),
        ..AppConfig::default()
    };
    config.validate()?;
    config.save(&config_path)?;

    let rules = RuleDocument::from_json(&rules(), RuleParseOptions::default())?;
    let guide = TroubleshootingGuide::from_json(&troubleshooting())?;
    let source = SqliteSource::open(&db_path)?;
    let mut session = Session::new(rules, guide, LogBuffer::new(1000));

    let path = auto_run(&mut session, &mut config, &config_path, &source, Arc::new(NoProgress))
        .await?
        .expect("run should not be canceled");

    // U4 is Manual and U5 is outside the window.
    assert_eq!(session.retrieved()["ST10"].height(), 3);
    assert_eq!(session.state(), Some("Auto"));
    assert_eq!(path, dir.path().join("Line3_Week_17.json"));

    let report: Value = serde_json::from_str(&fs::read_to_string(&path)?)?;
    assert_eq!(report["title"], "Line 3 - Week 17");
    assert_eq!(report["kpi"]["station"], "ST10");
    assert_eq!(report["kpi"]["total_units"], 3);
    assert_eq!(report["kpi"]["total_ng"], 2);
    assert_eq!(report["stations"][1]["station"], "ST20");
    assert_eq!(report["stations"][1]["ng"], 1);
    assert_eq!(report["ng_rate"]["granularity"], "day");
    assert_eq!(report["ng_rate"]["points"].as_array().map(Vec::len), Some(3));

    let st10_causes = &report["root_causes"][0];
    assert_eq!(st10_causes["station"], "ST10");
    assert_eq!(st10_causes["causes"][0]["cause"], "Leak");
    assert_eq!(st10_causes["causes"][1]["cause"], "Seal damaged");

    // ST20's `?` reading fails without a root cause, so the feature names it.
    let rows = report["troubleshooting"].as_array().expect("troubleshooting rows");
    assert_eq!(rows.len(), 3);
    let torque = rows
        .iter()
        .find(|row| row["station"] == "ST20")
        .expect("ST20 row");
    assert_eq!(torque["root_cause"], "Torque");
    assert_eq!(torque["methods"].as_array().map(Vec::len), Some(0));
    assert_eq!(torque["percentage"], 50.0);
    let leak = rows
        .iter()
        .find(|row| row["root_cause"] == "Leak")
        .expect("Leak row");
    assert_eq!(leak["methods"][0]["solution"], "Replace plug");

    let saved = AppConfig::load(&config_path)?;
    assert_eq!(saved.date_setup.as_deref(), Some("2024/05/08"));
    Ok(())
}

#[tokio::test]
async fn test_auto_run_with_explicit_tables_and_no_state() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let db_path = dir.path().join("stations.db");
    create_station_db(&db_path)?;

    let config_path = dir.path().join("app_config.json");
    let mut config = AppConfig {
        database: db_path.display().to_string(),
        auto_save_path: dir.path().display().to_string(),
        apply_state: false,
        selected_tables: Some(vec!["ST10".to_string()]),
        date_setup: Some("2024/05/01".to_string()),
        ..AppConfig::default()
    };

    let rules = RuleDocument::from_json(&rules(), RuleParseOptions::default())?;
    let source = SqliteSource::open(&db_path)?;
    let mut session = Session::new(rules, TroubleshootingGuide::default(), LogBuffer::default());

    let path = auto_run(&mut session, &mut config, &config_path, &source, Arc::new(NoProgress))
        .await?
        .expect("run should not be canceled");

    assert_eq!(path, dir.path().join("Report.json"));
    assert_eq!(session.selected_tables(), ["ST10".to_string()]);
    // The Manual unit is included once the state filter is off.
    assert_eq!(session.retrieved()["ST10"].height(), 4);
    assert_eq!(session.state(), None);

    let report: Value = serde_json::from_str(&fs::read_to_string(&path)?)?;
    assert_eq!(report["kpi"]["total_ng"], 3);
    assert_eq!(report["title"], "Report Title");
    Ok(())
}
