use std::path::PathBuf;

use shelf_extract::{find_next_page, CardStrategy, ExtractContext, ExtractionRules, ProductExtractor};
use url::Url;

const SITE: &str = "https://www.modademo.example/";

fn fixture(name: &str) -> String {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/modademo")
        .join(name);
    std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("read {}: {e}", path.display()))
}

fn extractor() -> ProductExtractor {
    ProductExtractor::for_site(&ExtractionRules::default(), SITE).unwrap()
}

#[test]
fn landing_page_yields_tagged_category_links() {
    let links = extractor().discover_categories(&fixture("landing.html"), &Url::parse(SITE).unwrap());
    let summary = links
        .iter()
        .map(|l| (l.url.as_str(), l.gender.as_str(), l.category.as_str()))
        .collect::<Vec<_>>();
    assert_eq!(
        summary,
        vec![
            ("https://www.modademo.example/es/mujer/camisetas", "Mujer", "Camisetas"),
            ("https://www.modademo.example/es/mujer/vestidos", "Mujer", "Vestidos"),
            ("https://www.modademo.example/es/hombre/pantalones", "Hombre", "Pantalones"),
        ]
    );
}

#[test]
fn first_listing_page_extracts_every_card_and_links_to_page_two() {
    let page_url = Url::parse("https://www.modademo.example/es/mujer/camisetas").unwrap();
    let markup = fixture("camisetas_page1.html");
    let report = extractor().extract(&markup, &ExtractContext::new(page_url.clone()));

    assert_eq!(report.strategy, CardStrategy::Selector("[data-product-id]".to_string()));
    assert_eq!(report.cards_seen, 6);
    assert_eq!(report.records.len(), 6);

    let first = &report.records[0];
    assert_eq!(first.brand, "MODADEMO");
    assert_eq!(first.name, "Camiseta básica blanca");
    assert_eq!(first.price, Some(12.95));
    assert_eq!(first.url, "https://www.modademo.example/es/p/mc101");
    assert_eq!(first.image_url.as_deref(), Some("https://cdn.modademo.example/img/mc101.jpg"));
    assert_eq!(first.category, "Camisetas");

    // sale price, not the struck-through one
    assert_eq!(report.records[5].price, Some(9.95));

    assert_eq!(
        find_next_page(&markup, &page_url).map(|u| u.to_string()),
        Some("https://www.modademo.example/es/mujer/camisetas?page=2".to_string())
    );
}

#[test]
fn last_listing_page_drops_sold_out_card_and_stops_pagination() {
    let page_url = Url::parse("https://www.modademo.example/es/mujer/camisetas?page=2").unwrap();
    let markup = fixture("camisetas_page2.html");
    let report = extractor().extract(&markup, &ExtractContext::new(page_url.clone()));

    assert_eq!(report.cards_seen, 6);
    assert_eq!(report.records.len(), 5);
    assert_eq!(report.dropped.missing_price, 1);
    assert!(report.records.iter().all(|r| r.name != "Camiseta algodón orgánico"));
    assert!(find_next_page(&markup, &page_url).is_none());
}
