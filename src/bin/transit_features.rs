use transit_delay::{
    init_logging, load_reference_data, log_pipeline_finish, log_pipeline_start,
    logging_config_from_env, pipeline_config_from_env, write_feature_table, CityNameNormalizer,
    DataFetcher, FeatureBuilder, HttpQueryClient,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;

    let cfg = pipeline_config_from_env()?;
    let run_id = cfg.fetch.run_id();
    log_pipeline_start(&logging_cfg, run_id.as_str(), &cfg.mode);

    // Mode and reference tables are checked before anything touches the network.
    let reference = load_reference_data(&cfg.reference, CityNameNormalizer::default())?;
    let builder = FeatureBuilder::new(&cfg.mode, cfg.features.clone(), &reference)?;

    let client = HttpQueryClient::new(cfg.http.clone())?;
    let mut fetcher = DataFetcher::new(client, cfg.fetch.clone())?;
    let ride_stops = fetcher.fetch()?;

    let features = builder.create_features(&ride_stops)?;
    write_feature_table(&cfg.output_path, &features)?;

    log_pipeline_finish(
        run_id.as_str(),
        ride_stops.len(),
        features.len(),
        &cfg.output_path,
    );
    Ok(())
}
