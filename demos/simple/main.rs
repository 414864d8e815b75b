use statsig_core::{ClientConfig, ExposureEvent, QueryOptions, StatsigUser};

#[tokio::main]
pub async fn main() -> statsig_core::Result<()> {
    // Configure env_logger to see SDK logs.
    env_logger::Builder::from_env(env_logger::Env::new().default_filter_or("statsig")).init();

    let sdk_key = std::env::var("STATSIG_CLIENT_KEY")
        .expect("STATSIG_CLIENT_KEY env variable should contain a client SDK key");
    let client = ClientConfig::from_sdk_key(sdk_key)
        .exposure_logger(|event: ExposureEvent| {
            println!("Logging exposure event: {:?}", event);
        })
        .to_client(Some(StatsigUser::with_user_id("test-user")))?;

    // Load cached values and fetch fresh ones. Until values arrive, queries return defaults.
    let details = client.initialize().await;
    if let Some(err) = details.error {
        println!("error fetching values: {:?}", err);
    }

    let gate = client.get_feature_gate("a_gate", QueryOptions::default())?;
    println!("Gate: {} ({:?})", gate.value, gate.evaluation_details);

    let experiment = client.get_experiment("an_experiment", QueryOptions::default())?;
    println!("Experiment: {:?}", experiment.value);

    // Switching users answers from cache right away and refreshes in the background.
    client
        .update_user(Some(StatsigUser::with_user_id("another-user")))
        .await?;
    println!("Evaluation details: {:?}", client.get_evaluation_details());

    Ok(())
}
