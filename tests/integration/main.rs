//! Integration tests for Strata

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use tempfile::TempDir;

    /// `strata` with an isolated config file and no repo settings from the environment
    fn strata(home: &TempDir) -> Command {
        let mut cmd = cargo_bin_cmd!("strata");
        cmd.env_remove("STRATA_IMAGES_REPO")
            .env_remove("STRATA_IMAGES_REPO_MODE")
            .env_remove("STRATA_STAGES_STORAGE")
            .env("STRATA_CONFIG", home.path().join("config.toml"));
        cmd
    }

    #[test]
    fn help_displays() {
        let home = TempDir::new().unwrap();
        strata(&home)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("incremental image stages"));
    }

    #[test]
    fn version_displays() {
        let home = TempDir::new().unwrap();
        strata(&home)
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("strata"));
    }

    #[test]
    fn multirepo_image_repo() {
        let home = TempDir::new().unwrap();
        strata(&home)
            .args(["image-repo", "--images-repo", "registry.example.com/shop", "api"])
            .assert()
            .success()
            .stdout("registry.example.com/shop/api\n");
    }

    #[test]
    fn monorepo_image_repo_with_tag() {
        let home = TempDir::new().unwrap();
        strata(&home)
            .args([
                "image-repo",
                "--images-repo",
                "registry.example.com/shop",
                "--images-repo-mode",
                "monorepo",
                "api",
                "--tag",
                "v1",
            ])
            .assert()
            .success()
            .stdout("registry.example.com/shop:api-v1\n");
    }

    #[test]
    fn nameless_image_uses_the_address() {
        let home = TempDir::new().unwrap();
        strata(&home)
            .args(["image-repo", "--images-repo", "registry.example.com/shop", "-t", "latest"])
            .assert()
            .success()
            .stdout("registry.example.com/shop:latest\n");
    }

    #[test]
    fn image_repo_reads_config() {
        let home = TempDir::new().unwrap();
        std::fs::write(
            home.path().join("config.toml"),
            "[images_repo]\naddress = \"registry.example.com/blog\"\nmode = \"monorepo\"\n",
        )
        .unwrap();

        strata(&home)
            .args(["image-repo", "web", "--tag", "main"])
            .assert()
            .success()
            .stdout("registry.example.com/blog:web-main\n");
    }

    #[test]
    fn bad_mode_fails() {
        let home = TempDir::new().unwrap();
        strata(&home)
            .args(["image-repo", "--images-repo", "repo", "--images-repo-mode", "polyrepo"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("polyrepo"));
    }

    #[test]
    fn separator_in_monorepo_name_fails() {
        let home = TempDir::new().unwrap();
        strata(&home)
            .args([
                "image-repo",
                "--images-repo",
                "repo",
                "--images-repo-mode",
                "monorepo",
                "back-end",
            ])
            .assert()
            .failure()
            .stderr(predicate::str::contains("separator"));
    }

    #[test]
    fn missing_address_fails_with_hint() {
        let home = TempDir::new().unwrap();
        strata(&home)
            .args(["image-repo", "api"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("images repo address is not set"))
            .stderr(predicate::str::contains("Hint:"));
    }

    #[test]
    fn config_path() {
        let home = TempDir::new().unwrap();
        strata(&home)
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));
    }

    #[test]
    fn config_init_then_show() {
        let home = TempDir::new().unwrap();
        strata(&home).args(["config", "init"]).assert().success();
        assert!(home.path().join("config.toml").exists());

        strata(&home)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[images_repo]"))
            .stdout(predicate::str::contains("mode = \"multirepo\""));
    }

    #[test]
    fn cleanup_without_project_config_fails() {
        let home = TempDir::new().unwrap();
        let project = TempDir::new().unwrap();
        strata(&home)
            .args(["cleanup", "--images-repo", "registry.example.com/shop", "--project"])
            .arg(project.path())
            .assert()
            .failure()
            .stderr(predicate::str::contains("strata.toml"));
    }

    #[test]
    fn cleanup_reports_unreachable_registry() {
        let home = TempDir::new().unwrap();
        let project = TempDir::new().unwrap();
        std::fs::write(
            project.path().join("strata.toml"),
            "[meta]\nproject = \"shop\"\n\n[[image]]\nname = \"api\"\nfrom = \"alpine\"\n",
        )
        .unwrap();

        strata(&home)
            .args([
                "cleanup",
                "--images-repo",
                "127.0.0.1:1/shop",
                "--insecure-registry",
                "--dry-run",
                "--project",
            ])
            .arg(project.path())
            .assert()
            .failure()
            .stderr(predicate::str::contains("Error:"))
            .stderr(predicate::str::contains("127.0.0.1:1/shop"));
    }
}
