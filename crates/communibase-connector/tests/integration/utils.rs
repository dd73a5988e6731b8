use communibase_connector::{Config, Connector};
use communibase_test as test;

pub use test::{MockApi, RecordedRequest};

pub const HENK: &str = "52259f95dafd757b06002221";
pub const PIET: &str = "52259f95dafd757b06002222";

/// Setup tests and create a connector talking to a fresh [`MockApi`].
///
/// Keep the returned API as guard until the test has finished, dropping it stops the server.
/// The `update_config` closure can modify any default configuration before the connector is
/// created.
pub fn setup_connector(update_config: impl FnOnce(&mut Config)) -> (Connector, MockApi) {
    test::setup();

    let api = MockApi::new();
    let mut config = Config {
        service_url: api.service_url(),
        api_key: Some("secret".into()),
        ..Default::default()
    };
    update_config(&mut config);

    let handle = tokio::runtime::Handle::current();
    let connector = Connector::new(config, handle).unwrap();

    (connector, api)
}
