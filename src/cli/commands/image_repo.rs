//! Image-repo command - print where an image is published

use crate::cli::args::ImageRepoArgs;
use crate::cli::commands::{naming, with_images_repo};
use crate::config::Config;
use crate::error::StrataResult;

/// Execute the image-repo command
pub async fn execute(args: ImageRepoArgs, config: &Config) -> StrataResult<()> {
    let naming = naming(&with_images_repo(&args.repo, config))?;
    naming.validate_image_name(&args.name)?;

    let reference = match &args.tag {
        Some(tag) => naming.image_repo_with_tag(&args.name, tag),
        None => naming.image_repo(&args.name),
    };
    println!("{}", reference);
    Ok(())
}
