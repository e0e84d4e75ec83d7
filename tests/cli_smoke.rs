use std::{path::Path, process::Command};

fn tagbooru(data_dir: &Path, layout: &str, args: &[&str]) -> (bool, String) {
    let output = Command::new(env!("CARGO_BIN_EXE_tagbooru"))
        .arg("--data-dir")
        .arg(data_dir)
        .args(["--layout", layout, "-q"])
        .args(args)
        .env_remove("TAGBOORU_LOG")
        .output()
        .expect("failed to run tagbooru");
    (
        output.status.success(),
        String::from_utf8_lossy(&output.stdout).into_owned(),
    )
}

fn created_id(json: &str) -> u64 {
    let post: serde_json::Value = serde_json::from_str(json).unwrap();
    post["id"].as_u64().unwrap()
}

#[test]
fn add_search_and_remove_posts() {
    for layout in ["join", "blob"] {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path();

        let (ok, out) = tagbooru(dir, layout, &[
            "post", "add", "--poster", "amy", "--tags", "cat dog", "--json",
        ]);
        assert!(ok);
        let first = created_id(&out);

        let (ok, out) = tagbooru(dir, layout, &[
            "post", "add", "--poster", "bob", "--tags", "cat", "--json",
        ]);
        assert!(ok);
        let second = created_id(&out);

        let (ok, out) =
            tagbooru(dir, layout, &["search", "--json", "cat", "-dog"]);
        assert!(ok);
        let page: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(page["total_count"], 1);
        assert_eq!(page["query"], "cat+-dog");
        assert_eq!(page["posts"][0]["id"].as_u64(), Some(second));
        assert_eq!(page["posts"][0]["tags"], serde_json::json!(["cat", "user:bob"]));

        let (ok, out) = tagbooru(dir, layout, &["tags", "--json", "-n", "1"]);
        assert!(ok);
        let tags: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(tags[0]["tag"], "cat");
        assert_eq!(tags[0]["count"], 2);

        let (ok, _) =
            tagbooru(dir, layout, &["post", "remove", &first.to_string()]);
        assert!(ok);

        let (ok, _) =
            tagbooru(dir, layout, &["post", "show", &first.to_string()]);
        assert!(!ok);

        let (ok, out) = tagbooru(dir, layout, &["status", "--json"]);
        assert!(ok);
        let status: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(status["posts"], 1);
        assert_eq!(status["layout"], layout);
    }
}

#[test]
fn completions_need_no_data_dir() {
    let output = Command::new(env!("CARGO_BIN_EXE_tagbooru"))
        .args(["completions", "bash"])
        .output()
        .expect("failed to run tagbooru");
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("tagbooru"));
}
