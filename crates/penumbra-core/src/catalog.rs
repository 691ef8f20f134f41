//! Catalog loading and `{{ variable }}` substitution.

use std::collections::HashMap;
use std::path::PathBuf;

use penumbra_schema::catalog::{CleanupStep, FilePush, InstallStep, Repository};
use penumbra_schema::Catalog;

use crate::error::{Error, Result};

const BUILTIN: &str = include_str!("../catalog/penumbra.toml");

/// Where a catalog is read from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CatalogSource {
    /// The catalog compiled into the binary.
    #[default]
    Builtin,
    File(PathBuf),
    Url(String),
}

/// The catalog shipped with the installer.
pub fn builtin() -> Result<Catalog> {
    parse(BUILTIN)
}

/// Parse and validate a TOML catalog.
pub fn parse(src: &str) -> Result<Catalog> {
    let catalog: Catalog = toml::from_str(src)?;
    catalog.validate()?;
    Ok(catalog)
}

pub async fn load(source: &CatalogSource, client: &reqwest::Client) -> Result<Catalog> {
    match source {
        CatalogSource::Builtin => builtin(),
        CatalogSource::File(path) => {
            let src = tokio::fs::read_to_string(path).await.map_err(|e| {
                Error::InvalidInput(format!("cannot read catalog {}: {e}", path.display()))
            })?;
            parse(&src)
        }
        CatalogSource::Url(url) => {
            let resp = client.get(url).send().await?;
            if !resp.status().is_success() {
                return Err(Error::DownloadFailed(format!(
                    "catalog {url}: HTTP {}",
                    resp.status()
                )));
            }
            parse(&resp.text().await?)
        }
    }
}

/// Merge declared defaults with caller overrides.
pub fn resolve_variables(
    catalog: &Catalog,
    overrides: &HashMap<String, String>,
) -> Result<HashMap<String, String>> {
    if let Some(unknown) = overrides
        .keys()
        .find(|k| !catalog.variables.iter().any(|v| &v.name == *k))
    {
        return Err(Error::InvalidInput(format!(
            "unknown variable override '{unknown}'"
        )));
    }

    let mut resolved = HashMap::new();
    for variable in &catalog.variables {
        match overrides.get(&variable.name).or(variable.default.as_ref()) {
            Some(value) => {
                resolved.insert(variable.name.clone(), value.clone());
            }
            None if variable.required => {
                return Err(Error::InvalidInput(format!(
                    "missing value for required variable '{}'",
                    variable.name
                )));
            }
            None => {}
        }
    }
    Ok(resolved)
}

/// Replace every placeholder in the catalog's step strings.
pub fn apply_variables(catalog: &mut Catalog, values: &HashMap<String, String>) -> Result<()> {
    substitute_in_place(&mut catalog.name, values)?;
    for step in &mut catalog.global_setup {
        substitute_install_step(step, values)?;
    }
    for repo in &mut catalog.repositories {
        substitute_repository(repo, values)?;
    }
    Ok(())
}

/// Expand `{{ name }}` placeholders in `input`.
pub fn substitute(input: &str, values: &HashMap<String, String>) -> Result<String> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find("}}").ok_or_else(|| {
            Error::InvalidInput(format!("unterminated placeholder in '{input}'"))
        })?;
        let name = after[..end].trim();
        if name.is_empty() {
            return Err(Error::InvalidInput(format!(
                "empty placeholder in '{input}'"
            )));
        }
        let value = values.get(name).ok_or_else(|| {
            Error::InvalidInput(format!("undefined variable '{name}' in '{input}'"))
        })?;
        out.push_str(value);
        rest = &after[end + 2..];
    }

    out.push_str(rest);
    Ok(out)
}

fn substitute_in_place(s: &mut String, values: &HashMap<String, String>) -> Result<()> {
    if s.contains("{{") {
        *s = substitute(s, values)?;
    }
    Ok(())
}

fn substitute_all(items: &mut [String], values: &HashMap<String, String>) -> Result<()> {
    items
        .iter_mut()
        .try_for_each(|s| substitute_in_place(s, values))
}

fn substitute_repository(repo: &mut Repository, values: &HashMap<String, String>) -> Result<()> {
    substitute_in_place(&mut repo.version, values)?;
    substitute_all(&mut repo.release_assets, values)?;
    substitute_all(&mut repo.repo_files, values)?;
    substitute_all(&mut repo.packages, values)?;
    for step in &mut repo.cleanup {
        match step {
            CleanupStep::UninstallPackages { patterns: items }
            | CleanupStep::RemoveDirectories { paths: items }
            | CleanupStep::RemoveDirectoriesIfEmpty { paths: items }
            | CleanupStep::RemoveFiles { paths: items } => substitute_all(items, values)?,
        }
    }
    for step in &mut repo.installation {
        substitute_install_step(step, values)?;
    }
    Ok(())
}

fn substitute_install_step(step: &mut InstallStep, values: &HashMap<String, String>) -> Result<()> {
    match step {
        InstallStep::CreateDirectories { paths } => substitute_all(paths, values)?,
        InstallStep::InstallApks {
            priority_order,
            exclude_patterns,
            ..
        } => {
            substitute_all(priority_order, values)?;
            substitute_all(exclude_patterns, values)?;
        }
        InstallStep::PushFiles { files } => {
            for FilePush {
                local,
                remote,
                chmod,
            } in files
            {
                substitute_in_place(local, values)?;
                substitute_in_place(remote, values)?;
                if let Some(mode) = chmod {
                    substitute_in_place(mode, values)?;
                }
            }
        }
        InstallStep::GrantPermissions { grants } => {
            for grant in grants {
                substitute_in_place(&mut grant.package, values)?;
                substitute_in_place(&mut grant.permission, values)?;
            }
        }
        InstallStep::SetAppOps { ops } => {
            for op in ops {
                substitute_in_place(&mut op.package, values)?;
                substitute_in_place(&mut op.operation, values)?;
                substitute_in_place(&mut op.mode, values)?;
            }
        }
        InstallStep::RunCommand { command, .. } => substitute_in_place(command, values)?,
        InstallStep::SetLauncher { component } => substitute_in_place(component, values)?,
        InstallStep::CreateConfig { path, content, .. } => {
            substitute_in_place(path, values)?;
            substitute_in_place(content, values)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_builtin_catalog_loads() {
        let catalog = builtin().unwrap();
        assert_eq!(catalog.name, "PenumbraOS");
        let names: Vec<_> = catalog.repositories.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["pinitd", "sdk", "mabl"]);
        assert!(catalog.repository("mabl").unwrap().depends_on.contains(&"sdk".to_string()));
    }

    #[test]
    fn test_substitute() {
        let values = vars(&[("backend", "openai")]);
        assert_eq!(
            substitute("plugins.{{ backend }}.{{backend}}", &values).unwrap(),
            "plugins.openai.openai"
        );
        assert_eq!(substitute("no placeholders", &values).unwrap(), "no placeholders");
        assert!(matches!(substitute("{{ }}", &values), Err(Error::InvalidInput(_))));
        assert!(matches!(substitute("{{ backend", &values), Err(Error::InvalidInput(_))));
        assert!(matches!(substitute("{{ other }}", &values), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_builtin_variables_apply() {
        let mut catalog = builtin().unwrap();
        let values = resolve_variables(&catalog, &vars(&[("assistant_backend", "searxng")])).unwrap();
        apply_variables(&mut catalog, &values).unwrap();

        let mabl = catalog.repository("mabl").unwrap();
        let content = mabl
            .installation
            .iter()
            .find_map(|s| match s {
                InstallStep::CreateConfig { content, .. } => Some(content.clone()),
                _ => None,
            })
            .unwrap();
        assert!(content.contains("com.penumbraos.plugins.searxng"));
    }

    #[test]
    fn test_unknown_override_rejected() {
        let catalog = builtin().unwrap();
        assert!(matches!(
            resolve_variables(&catalog, &vars(&[("nope", "x")])),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_required_variable_must_be_supplied() {
        let src = r#"
name = "T"

[[variables]]
name = "serial"
required = true

[[repositories]]
name = "a"
owner = "o"
repo = "r"
release_assets = ["*.apk"]
"#;
        let catalog = parse(src).unwrap();
        assert!(resolve_variables(&catalog, &HashMap::new()).is_err());
        let values = resolve_variables(&catalog, &vars(&[("serial", "X1")])).unwrap();
        assert_eq!(values["serial"], "X1");
    }

    #[test]
    fn test_invalid_catalog_is_invalid_input() {
        let err = parse("name = \"T\"\nrepositories = []\n").unwrap_err();
        assert_eq!(err.kind(), penumbra_schema::ErrorKind::InvalidInput);
        assert!(parse("not = [valid").is_err());
    }

    #[tokio::test]
    async fn test_load_from_url() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/catalog.toml")
            .with_status(200)
            .with_body("name = \"Remote\"\n[[repositories]]\nname = \"a\"\nowner = \"o\"\nrepo = \"r\"\nrelease_assets = [\"*.apk\"]\n")
            .create_async()
            .await;

        let source = CatalogSource::Url(format!("{}/catalog.toml", server.url()));
        let catalog = load(&source, &reqwest::Client::new()).await.unwrap();
        assert_eq!(catalog.name, "Remote");
    }
}
