use rst_core::config::TrackingConfig;
use rst_core::data::SearchWindow;
use rst_core::error::RstError;
use rst_core::loss::Loss;
use rst_core::reference::ReferenceMethod;
use rst_core::refine::{
    DifferentialEvolutionParams, GridSearchParams, NewtonParams, RandomSearchParams,
    SearchStrategy,
};

#[test]
fn test_default_config() {
    let config = TrackingConfig::default();
    assert_eq!(config.sigma, 1.0);
    assert_eq!(config.threads, 1);
    assert_eq!(config.reference.method, ReferenceMethod::KernelRegression);
    assert_eq!(config.reference.bandwidth, 1.0);
    assert_eq!(config.pixel_map.loss, Loss::Huber);
    assert_eq!(
        config.pixel_map.strategy,
        SearchStrategy::Grid(GridSearchParams { grid_size: 25 })
    );
    assert_eq!(config.translation.grid_size, 10);
    assert!(config.validate().is_ok());
}

#[test]
fn test_toml_roundtrip() {
    let mut config = TrackingConfig::default();
    config.sigma = 0.4;
    config.threads = 4;
    config.reference.method = ReferenceMethod::Lowess;
    config.pixel_map.window = SearchWindow::new(2.0, 3.5).unwrap();
    config.pixel_map.strategy = SearchStrategy::Evolution(DifferentialEvolutionParams {
        pop_size: 12,
        seed: 99,
        ..Default::default()
    });
    config.translation.loss = Loss::Epsilon;

    let text = config.to_toml_string().unwrap();
    let parsed = TrackingConfig::from_toml_str(&text).unwrap();
    assert_eq!(parsed, config);
}

#[test]
fn test_partial_toml_takes_defaults() {
    let text = r#"
sigma = 0.5

[reference]
method = "Lowess"

[pixel_map.strategy]
kind = "random"
n_trials = 30
"#;
    let config = TrackingConfig::from_toml_str(text).unwrap();
    assert_eq!(config.sigma, 0.5);
    assert_eq!(config.threads, 1);
    assert_eq!(config.reference.method, ReferenceMethod::Lowess);
    assert_eq!(config.reference.bandwidth, 1.0);
    assert_eq!(
        config.pixel_map.strategy,
        SearchStrategy::Random(RandomSearchParams {
            n_trials: 30,
            seed: 0
        })
    );
    assert_eq!(config.translation.grid_size, 10);
}

#[test]
fn test_invalid_values_are_rejected() {
    let text = r#"
[pixel_map.strategy]
kind = "evolution"
pop_size = 3
"#;
    assert!(matches!(
        TrackingConfig::from_toml_str(text),
        Err(RstError::InvalidArgument(_))
    ));

    assert!(matches!(
        TrackingConfig::from_toml_str("sigma = -2.0"),
        Err(RstError::InvalidArgument(_))
    ));
    assert!(matches!(
        TrackingConfig::from_toml_str("threads = 0"),
        Err(RstError::InvalidArgument(_))
    ));
    assert!(matches!(
        TrackingConfig::from_toml_str("[translation]\ngrid_size = 0"),
        Err(RstError::InvalidArgument(_))
    ));
    assert!(matches!(
        TrackingConfig::from_toml_str("sigma = \"wide\""),
        Err(RstError::Config(_))
    ));
}

#[test]
fn test_config_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tracking.toml");
    std::fs::write(
        &path,
        "threads = 2\n\n[pixel_map.strategy]\nkind = \"newton\"\nmax_iter = 8\n",
    )
    .unwrap();

    let config = TrackingConfig::from_toml_file(&path).unwrap();
    assert_eq!(config.threads, 2);
    assert_eq!(
        config.pixel_map.strategy,
        SearchStrategy::Newton(NewtonParams {
            l1: 1.0,
            max_iter: 8
        })
    );

    let missing = dir.path().join("missing.toml");
    assert!(matches!(
        TrackingConfig::from_toml_file(&missing),
        Err(RstError::Io(_))
    ));
}

#[test]
fn test_strategy_json_tagging() {
    let strategy: SearchStrategy =
        serde_json::from_str(r#"{"kind": "evolution", "pop_size": 6}"#).unwrap();
    assert_eq!(
        strategy,
        SearchStrategy::Evolution(DifferentialEvolutionParams {
            pop_size: 6,
            ..Default::default()
        })
    );

    let json = serde_json::to_value(SearchStrategy::Grid(GridSearchParams { grid_size: 9 })).unwrap();
    assert_eq!(json["kind"], "grid");
    assert_eq!(json["grid_size"], 9);
}

#[test]
fn test_display() {
    assert_eq!(
        SearchStrategy::Grid(GridSearchParams { grid_size: 5 }).to_string(),
        "Grid search (5x5)"
    );
    assert_eq!(
        SearchStrategy::Evolution(DifferentialEvolutionParams::default()).to_string(),
        "Differential evolution (NP=10, 20 generations)"
    );
    let summary = TrackingConfig::default().to_string();
    assert!(summary.contains("Kernel Regression"));
    assert!(summary.contains("Grid search (25x25)"));
}
