//! Unit tests for source image resolution.

use rstest::{fixture, rstest};

use super::*;
use crate::client::ImagePage;
use crate::test_support::{FakeCloud, api_error, image};

fn tag_filter(pairs: &[(&str, &str)], most_recent: bool) -> ImageFilter {
    ImageFilter {
        tag_filters: pairs
            .iter()
            .map(|(key, value)| ((*key).to_owned(), (*value).to_owned()))
            .collect(),
        most_recent,
        ..ImageFilter::default()
    }
}

#[fixture]
fn tagged_cloud() -> FakeCloud {
    let cloud = FakeCloud::new("home");
    cloud.add_image("home", image("img-a", "a", "env=prod", "2024-03-01T10:00:00Z"));
    cloud.add_image("home", image("img-b", "b", "env=dev", "2024-05-01T10:00:00Z"));
    cloud.add_image("home", image("img-c", "c", "env=prod", "2024-04-01T10:00:00Z"));
    cloud
}

#[rstest]
#[case("env=prod,team=web", true)]
#[case("team=web,env=prod", true)]
#[case("env=dev,team=web", false)]
#[case("team=web", false)]
#[case("", false)]
#[case("no tags here", false)]
#[case("env=prod=extra,team=web", false)]
#[case(",,env=prod,", true)]
fn description_matching(#[case] description: &str, #[case] expected: bool) {
    let filter = tag_filter(&[("env", "prod")], false);
    assert_eq!(filter.matches_description(description), expected);
}

#[rstest]
fn custom_delimiter_is_honoured() {
    let mut filter = tag_filter(&[("env", "prod"), ("team", "web")], false);
    filter.tag_delimiter = String::from(";");
    assert!(filter.matches_description("env=prod;team=web"));
    assert!(!filter.matches_description("env=prod,team=web"));
}

#[rstest]
fn without_tag_filters_every_description_matches() {
    assert!(ImageFilter::default().matches_description(""));
    assert!(ImageFilter::default().is_empty());
}

#[rstest]
#[tokio::test]
async fn ambiguous_without_most_recent(tagged_cloud: FakeCloud) {
    let err = tag_filter(&[("env", "prod")], false)
        .find_image(&tagged_cloud)
        .await
        .expect_err("two prod images");
    assert_eq!(err, ImageFilterError::Ambiguous { count: 2 });
}

#[rstest]
#[tokio::test]
async fn most_recent_picks_latest_matching(tagged_cloud: FakeCloud) {
    let found = tag_filter(&[("env", "prod")], true)
        .find_image(&tagged_cloud)
        .await
        .expect("latest prod image");
    assert_eq!(found.id, "img-c");
}

#[rstest]
#[tokio::test]
async fn no_match_is_an_error(tagged_cloud: FakeCloud) {
    let err = tag_filter(&[("env", "qa")], true)
        .find_image(&tagged_cloud)
        .await
        .expect_err("no qa image");
    assert_eq!(err, ImageFilterError::NoMatch);
}

#[rstest]
fn equal_timestamps_keep_first_seen() {
    let filter = tag_filter(&[], true);
    let chosen = filter
        .select(vec![
            image("first", "x", "", "2024-01-01T00:00:00Z"),
            image("second", "x", "", "2024-01-01T00:00:00Z"),
        ])
        .expect("tie resolves");
    assert_eq!(chosen.id, "first");
}

#[rstest]
fn unparseable_timestamps_are_skipped() {
    let filter = tag_filter(&[], true);
    let chosen = filter
        .select(vec![
            image("broken", "x", "", "yesterday"),
            image("older", "x", "", "2023-01-01T00:00:00Z"),
            image("newer", "x", "", "2023-06-01T00:00:00+02:00"),
        ])
        .expect("parseable candidates remain");
    assert_eq!(chosen.id, "newer");
}

#[rstest]
fn no_parseable_timestamp_is_an_error() {
    let filter = tag_filter(&[], true);
    let err = filter
        .select(vec![image("a", "x", "", ""), image("b", "x", "", "soon")])
        .expect_err("nothing parses");
    assert_eq!(err, ImageFilterError::NoParseableTimestamp { count: 2 });
}

#[rstest]
#[tokio::test]
async fn pages_are_accumulated_until_total_is_reached() {
    let cloud = FakeCloud::new("home");
    let first: Vec<Image> = (0..100)
        .map(|index| image(&format!("img-{index}"), "x", "env=dev", "2024-01-01T00:00:00Z"))
        .collect();
    cloud.script_image_page(
        "home",
        Ok(ImagePage {
            total_count: 101,
            images: first,
        }),
    );
    cloud.script_image_page(
        "home",
        Ok(ImagePage {
            total_count: 101,
            images: vec![image("img-last", "x", "env=prod", "2024-01-01T00:00:00Z")],
        }),
    );

    let found = tag_filter(&[("env", "prod")], false)
        .find_image(&cloud)
        .await
        .expect("match on second page");
    assert_eq!(found.id, "img-last");
    assert_eq!(cloud.count("home", "describe_images"), 2);
}

#[rstest]
#[tokio::test]
async fn listing_errors_propagate() {
    let cloud = FakeCloud::new("home");
    cloud.fail_next("home", "describe_images", api_error("DescribeImages"));
    let err = tag_filter(&[("env", "prod")], false)
        .find_image(&cloud)
        .await
        .expect_err("listing fails");
    assert!(matches!(err, ImageFilterError::Client(_)));
}

#[rstest]
#[tokio::test]
async fn direct_id_resolution(tagged_cloud: FakeCloud) {
    let found = resolve_source_image(&tagged_cloud, &SourceImage::Id(String::from("img-b")))
        .await
        .expect("image exists");
    assert_eq!(found.name, "b");

    let err = resolve_source_image(&tagged_cloud, &SourceImage::Id(String::from("img-z")))
        .await
        .expect_err("image missing");
    assert_eq!(
        err,
        ImageFilterError::NotFound {
            image_id: String::from("img-z")
        }
    );
}
