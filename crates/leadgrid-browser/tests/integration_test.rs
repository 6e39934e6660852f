use leadgrid_browser::{BrowserActions, BrowserEngine, SessionFactory};
use leadgrid_core::BrowserConfig;

#[tokio::test]
#[ignore = "Requires Chrome browser to be installed"]
async fn test_browser_engine_launch() {
    let engine = BrowserEngine::launch(&BrowserConfig::default()).await;
    assert!(engine.is_ok(), "Failed to launch browser engine");
    engine.unwrap().shutdown().await;
}

#[tokio::test]
#[ignore = "Requires Chrome browser to be installed"]
async fn test_session_navigation_and_content() {
    let engine = BrowserEngine::launch(&BrowserConfig::default()).await.unwrap();
    let session = engine.open_session().await.unwrap();

    session.navigate("https://example.com").await.unwrap();
    session.wait_for_selector("h1", 5_000).await.unwrap();
    assert_eq!(session.count("h1").await.unwrap(), 1);
    assert!(session.content().await.unwrap().contains("Example Domain"));
    assert!(!session.scroll_to_bottom("#does-not-exist").await.unwrap());

    session.close().await.unwrap();
    engine.shutdown().await;
}
