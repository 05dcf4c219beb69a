use unleash_client::{ClientConfig, Context, Event};

pub fn main() -> unleash_client::Result<()> {
    // Configure env_logger to see SDK logs.
    env_logger::Builder::from_env(env_logger::Env::new().default_filter_or("unleash")).init();

    let url = std::env::var("UNLEASH_URL")
        .unwrap_or_else(|_| "https://app.unleash-hosted.com/demo/api/".to_owned());
    let token = std::env::var("UNLEASH_API_TOKEN")
        .expect("UNLEASH_API_TOKEN env variable should contain a client API token");

    let client = ClientConfig::new("simple-demo", url)
        .with_authorization(token)
        .with_listener(|event: &Event| match event {
            Event::Changed(delta) => println!("toggles changed: {:?}", delta.names()),
            Event::Error(err) => println!("synchronization failed: {err}"),
            _ => {}
        })
        .to_client()?;

    // Block waiting for the first fetch. Until then, every toggle evaluates to its fallback.
    client.start()?;

    let context = Context::new().with_user_id("test-user");
    let enabled = client.is_enabled("a-toggle", &context, false);
    let variant = client.get_variant("a-toggle", &context);

    println!("Enabled: {enabled}, variant: {variant:?}");

    client.shutdown()
}
