// Unit tests for config module

use super::*;
use pretty_assertions::assert_eq;
use std::io::Write;

const SITES_JSON: &str = r##"{
  "sites": [
    {
      "url_pattern": "^https://vpn\\.example\\.com/",
      "priority": 10,
      "username_selectors": ["input#login"],
      "domain_selectors": ["select#realm"],
      "additional_wait_ms": 500,
      "failure_indicators": [{ "text": "access denied" }],
      "success_indicators": [{ "selector": "#portal-home" }]
    },
    {
      "url_pattern": "example\\.com",
      "requires_javascript": true
    }
  ]
}"##;

#[test]
fn test_parse_sites_object() {
    let set = ConfigSet::from_json_str(SITES_JSON).unwrap();
    assert_eq!(set.len(), 2);

    let vpn = set.primary("https://vpn.example.com/login").unwrap();
    assert_eq!(vpn.priority, 10);
    assert_eq!(vpn.selectors(FieldKind::Username), ["input#login".to_string()]);
    assert!(vpn.selectors(FieldKind::Password).is_empty());
    assert_eq!(vpn.additional_wait(), Duration::from_millis(500));
    assert_eq!(
        vpn.failure_indicators,
        vec![Indicator::Text("access denied".to_string())]
    );
    assert_eq!(
        vpn.success_indicators,
        vec![Indicator::Selector("#portal-home".to_string())]
    );
    assert!(!vpn.requires_javascript);
}

#[test]
fn test_parse_bare_list() {
    let set = ConfigSet::from_json_str(
        r##"[{ "url_pattern": "^https://a\\.test/", "password_selectors": ["#pw"] }]"##,
    )
    .unwrap();
    assert_eq!(set.len(), 1);
    assert_eq!(
        set.primary("https://a.test/login").unwrap().password_selectors,
        vec!["#pw".to_string()]
    );
    assert!(set.primary("https://b.test/login").is_none());
}

#[test]
fn test_invalid_json_is_configuration_error() {
    let err = ConfigSet::from_json_str("{ not json").unwrap_err();
    assert!(matches!(err, LoginError::Configuration(_)));
}

#[test]
fn test_invalid_pattern_rejects_set() {
    let err = ConfigSet::new(vec![
        LoginPageConfiguration::new("^https://ok\\.test/"),
        LoginPageConfiguration::new("(unclosed"),
    ])
    .unwrap_err();

    match err {
        LoginError::Configuration(message) => assert!(message.contains("(unclosed")),
        other => panic!("unexpected error: {}", other),
    }
}

#[test]
fn test_matching_orders_by_priority_then_load_order() {
    let set = ConfigSet::new(vec![
        LoginPageConfiguration::new("example").with_priority(1),
        LoginPageConfiguration::new("example\\.com").with_priority(5),
        LoginPageConfiguration::new("^https://").with_priority(1),
        LoginPageConfiguration::new("nomatch").with_priority(99),
    ])
    .unwrap();

    let patterns: Vec<&str> = set
        .matching("https://www.example.com/login")
        .iter()
        .map(|c| c.url_pattern.as_str())
        .collect();
    assert_eq!(patterns, vec!["example\\.com", "example", "^https://"]);
}

#[test]
fn test_builder_sets_selectors_per_field() {
    let config = LoginPageConfiguration::new(".*")
        .with_selectors(FieldKind::Submit, &["#go", "button.primary"])
        .with_failure(Indicator::Selector(".login-error".to_string()));

    assert_eq!(
        config.selectors(FieldKind::Submit),
        ["#go".to_string(), "button.primary".to_string()]
    );
    assert_eq!(config.failure_indicators.len(), 1);
}

#[test]
fn test_from_path_reads_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(SITES_JSON.as_bytes()).unwrap();

    let set = ConfigSet::from_path(file.path()).unwrap();
    assert_eq!(set.len(), 2);
}

#[test]
fn test_from_missing_path_is_configuration_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = ConfigSet::from_path(&dir.path().join("missing.json")).unwrap_err();
    assert!(matches!(err, LoginError::Configuration(_)));
}

#[test]
fn test_default_path_lives_under_home() {
    if let Some(path) = ConfigSet::default_path() {
        assert!(path.ends_with(".autologin/sites.json"));
    }
}

#[test]
fn test_shrink_deadlines_proportionally() {
    let deadlines = PhaseDeadlines {
        detection: Duration::from_secs(20),
        entry: Duration::from_secs(20),
        verification: Duration::from_secs(10),
    };

    let shrunk = deadlines.shrink_to(Duration::from_secs(25));
    assert_eq!(shrunk.detection, Duration::from_secs(10));
    assert_eq!(shrunk.entry, Duration::from_secs(10));
    assert_eq!(shrunk.verification, Duration::from_secs(5));

    // Plenty of time left: unchanged
    assert_eq!(deadlines.shrink_to(Duration::from_secs(120)), deadlines);
}

#[test]
fn test_deadlines_follow_overall_timeout() {
    let mut settings = AttemptSettings::default();
    assert_eq!(settings.deadlines_at(Duration::from_secs(500)), settings.deadlines);

    settings.overall_timeout = Some(Duration::from_secs(65));
    assert_eq!(settings.deadlines_at(Duration::ZERO), settings.deadlines);

    let late = settings.deadlines_at(Duration::from_secs(52));
    assert!(late.total() <= Duration::from_millis(13_001));
    assert!(late.detection < settings.deadlines.detection);

    let exhausted = settings.deadlines_at(Duration::from_secs(90));
    assert_eq!(exhausted.total(), Duration::ZERO);
}

#[test]
fn test_progressive_overall_deadline() {
    let settings = ProgressiveSettings::default();
    assert_eq!(settings.overall_deadline(), Duration::from_secs(25));

    let short = ProgressiveSettings {
        stage_deadline: Duration::from_secs(2),
        ..Default::default()
    };
    assert_eq!(short.overall_deadline(), Duration::from_secs(6));
}

#[test]
fn test_default_attempt_settings() {
    let settings = AttemptSettings::default();
    assert_eq!(settings.domain_skip_sentinel, "none");
    assert_eq!(settings.retry.attempt_count, 3);
    assert_eq!(settings.max_context_depth, 3);
    assert!(settings.navigate);
    assert!(settings.overall_timeout.is_none());
}
