//! `skillpack inspect` command: display skill metadata as JSON.

use clap::Args;
use skillpack_core::SkillpackConfig;

#[derive(Args)]
pub struct InspectArgs {
    /// Local tag or digest to inspect
    pub reference: String,
}

pub async fn execute(args: InspectArgs, config: &SkillpackConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store = super::open_store(config)?;
    let digest = super::resolve_local(&store, &args.reference)?;

    let root = store.descriptor(&digest)?;
    let annotations = if store.is_index(&digest)? {
        store.get_index(&digest)?.annotations
    } else {
        store.get_image_manifest(&digest)?.annotations
    };

    let manifests: Vec<serde_json::Value> = super::load_manifests(&store, &digest)?
        .iter()
        .map(|m| {
            serde_json::json!({
                "Digest": m.digest.to_string(),
                "Platform": m.platform.as_ref().map(|p| p.to_string()),
                "Created": m.config.created,
                "Layers": m.manifest.layers.iter().map(|l| serde_json::json!({
                    "Digest": l.digest.to_string(),
                    "Size": l.size,
                })).collect::<Vec<_>>(),
            })
        })
        .collect();

    let skill = super::skill_labels(&store, &digest)?.unwrap_or_default();
    let tags: Vec<String> = store
        .list_tags()?
        .into_iter()
        .filter(|t| store.resolve(t).map(|d| d == digest).unwrap_or(false))
        .collect();

    let output = serde_json::json!({
        "Digest": digest.to_string(),
        "MediaType": root.media_type,
        "Size": root.size,
        "Tags": tags,
        "Skill": {
            "Name": skill.name,
            "Description": skill.description,
            "Version": skill.version,
            "AllowedTools": skill.allowed_tools,
            "License": skill.license,
            "Files": skill.files,
        },
        "Annotations": annotations,
        "Manifests": manifests,
    });

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
