//! Package control file
//!
//! The control file lives at `OPSI/control` in a package source tree and
//! describes the product, its build-time package dependencies, its action
//! dependencies and its properties.
//!
//! ## Format
//!
//! ```text
//! [Package]
//! version: 2
//! depends: base-tools (>= 1.0)
//!
//! [Product]
//! type: localboot
//! id: firefox
//! version: 115.0
//! priority: 10
//! description: Web browser
//!  second line of the description
//!
//! [ProductDependency]
//! action: setup
//! requiredProduct: vcredist
//! requiredStatus: installed
//! requirementType: before
//! ```
//!
//! Lines starting with `;` or `#` are comments. Indented lines continue the
//! previous field. `[ProductDependency]` and `[ProductProperty]` may repeat.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{FleetpkgError, Result};
use crate::package::{
    ActionRequest, DependencyTarget, InstallationStatus, PackageDependency, Product,
    ProductDependency, ProductProperty, ProductType, PropertyKind, Requirement,
    RequirementType, Scripts, MAX_PRIORITY, MIN_PRIORITY,
};

/// Name of the control file inside the OPSI area
pub const CONTROL_FILENAME: &str = "control";

/// Package-level metadata from the `[Package]` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageInfo {
    /// Package version, defaults to `1`
    pub version: String,

    /// Packages that must already be installed on the depot
    #[serde(default)]
    pub depends: Vec<PackageDependency>,

    /// Keep the previous client-data directory on upgrade
    #[serde(default)]
    pub incremental: bool,
}

impl Default for PackageInfo {
    fn default() -> Self {
        Self {
            version: "1".to_string(),
            depends: Vec::new(),
            incremental: false,
        }
    }
}

/// Parsed control file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlFile {
    pub package: PackageInfo,
    pub product: Product,
    pub dependencies: Vec<ProductDependency>,
    pub properties: Vec<ProductProperty>,
    pub changelog: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SectionKind {
    Package,
    Product,
    Windows,
    ProductDependency,
    ProductProperty,
    Changelog,
    Unknown,
}

impl SectionKind {
    fn from_header(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "package" => SectionKind::Package,
            "product" => SectionKind::Product,
            "windows" => SectionKind::Windows,
            "productdependency" => SectionKind::ProductDependency,
            "productproperty" => SectionKind::ProductProperty,
            "changelog" => SectionKind::Changelog,
            _ => SectionKind::Unknown,
        }
    }
}

#[derive(Debug)]
struct Field {
    key: String,
    value: String,
    line: usize,
}

#[derive(Debug)]
struct Section {
    kind: SectionKind,
    name: String,
    line: usize,
    fields: Vec<Field>,
    raw: Vec<String>,
}

impl Section {
    fn get(&self, key: &str) -> Option<&Field> {
        self.fields.iter().rev().find(|f| f.key == key)
    }

    fn value(&self, key: &str) -> Option<&str> {
        self.get(key).map(|f| f.value.as_str())
    }

    fn require(&self, key: &str, field: &str) -> Result<&Field> {
        match self.get(key) {
            Some(f) if !f.value.is_empty() => Ok(f),
            _ => Err(FleetpkgError::parse(
                self.line,
                field,
                format!("required in [{}] section", self.name),
            )),
        }
    }

    fn bool(&self, key: &str, field: &str) -> Result<bool> {
        match self.get(key) {
            Some(f) if !f.value.is_empty() => parse_bool(&f.value)
                .ok_or_else(|| FleetpkgError::parse(f.line, field, "expected a boolean")),
            _ => Ok(false),
        }
    }

    fn optional(&self, key: &str) -> Option<String> {
        self.value(key)
            .filter(|v| !v.is_empty())
            .map(|v| v.to_string())
    }
}

impl ControlFile {
    /// Parse a control file from a string
    pub fn parse(input: &str) -> Result<Self> {
        let sections = split_sections(input)?;

        let mut package: Option<PackageInfo> = None;
        let mut product: Option<Product> = None;
        let mut software_ids: Vec<String> = Vec::new();
        let mut changelog = String::new();
        let mut dependency_sections = Vec::new();
        let mut property_sections = Vec::new();

        for section in &sections {
            match section.kind {
                SectionKind::Package => {
                    if package.is_some() {
                        return Err(FleetpkgError::parse(section.line, "Package", "duplicate section"));
                    }
                    package = Some(parse_package(section)?);
                }
                SectionKind::Product => {
                    if product.is_some() {
                        return Err(FleetpkgError::parse(section.line, "Product", "duplicate section"));
                    }
                    product = Some(parse_product(section)?);
                }
                SectionKind::Windows => {
                    if let Some(ids) = section.value("softwareids") {
                        software_ids.extend(split_list(ids));
                    }
                }
                SectionKind::ProductDependency => dependency_sections.push(section),
                SectionKind::ProductProperty => property_sections.push(section),
                SectionKind::Changelog => {
                    changelog = section.raw.join("\n").trim_matches('\n').trim_end().to_string();
                }
                SectionKind::Unknown => {
                    tracing::warn!(
                        "Ignoring unknown control file section [{}] at line {}",
                        section.name,
                        section.line
                    );
                }
            }
        }

        let package = package.unwrap_or_default();
        let mut product = product.ok_or_else(|| {
            FleetpkgError::parse(1, "Product", "control file has no [Product] section")
        })?;
        product.package_version = package.version.clone();
        product.windows_software_ids = dedup(software_ids);

        let dependencies = dependency_sections
            .into_iter()
            .map(|s| parse_dependency(s, &product))
            .collect::<Result<Vec<_>>>()?;

        let properties = property_sections
            .into_iter()
            .map(|s| parse_property(s, &product))
            .collect::<Result<Vec<_>>>()?;

        Ok(ControlFile {
            package,
            product,
            dependencies,
            properties,
            changelog,
        })
    }

    /// Read and parse a control file from disk
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Write the serialized control file to disk
    pub fn write_file(&self, path: &Path) -> Result<()> {
        fs::write(path, self.serialize())?;
        Ok(())
    }

    /// Serialize back into control file text
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        let product = &self.product;

        out.push_str("[Package]\n");
        write_field(&mut out, "version", &self.package.version);
        let depends: Vec<String> = self.package.depends.iter().map(|d| d.to_string()).collect();
        write_field(&mut out, "depends", &depends.join(", "));
        write_field(&mut out, "incremental", bool_str(self.package.incremental));
        out.push('\n');

        out.push_str("[Product]\n");
        write_field(&mut out, "type", &product.product_type.to_string());
        write_field(&mut out, "id", &product.id);
        write_field(&mut out, "name", &product.name);
        write_field(&mut out, "description", &product.description);
        write_field(&mut out, "advice", &product.advice);
        write_field(&mut out, "version", &product.product_version);
        write_field(&mut out, "priority", &product.priority.to_string());
        write_field(&mut out, "licenseRequired", bool_str(product.license_required));
        write_field(&mut out, "productClasses", &product.product_class_ids.join(", "));
        let scripts = [
            ("setupScript", &product.scripts.setup),
            ("uninstallScript", &product.scripts.uninstall),
            ("updateScript", &product.scripts.update),
            ("alwaysScript", &product.scripts.always),
            ("onceScript", &product.scripts.once),
            ("customScript", &product.scripts.custom),
            ("userLoginScript", &product.scripts.user_login),
        ];
        for (key, script) in scripts {
            if let Some(script) = script {
                write_field(&mut out, key, script);
            }
        }
        if product.product_type == ProductType::Netboot {
            if let Some(template) = &product.pxe_config_template {
                write_field(&mut out, "pxeConfigTemplate", template);
            }
        }
        out.push('\n');

        if !product.windows_software_ids.is_empty() {
            out.push_str("[Windows]\n");
            write_field(&mut out, "softwareIds", &product.windows_software_ids.join(", "));
            out.push('\n');
        }

        for dep in &self.dependencies {
            out.push_str("[ProductDependency]\n");
            write_field(&mut out, "action", &dep.action.to_string());
            match &dep.target {
                DependencyTarget::Product(id) => write_field(&mut out, "requiredProduct", id),
                DependencyTarget::ProductClass(id) => {
                    write_field(&mut out, "requiredProductClass", id)
                }
            }
            match dep.requirement {
                Requirement::Status(status) => {
                    write_field(&mut out, "requiredStatus", &status.to_string())
                }
                Requirement::Action(action) => {
                    write_field(&mut out, "requiredAction", &action.to_string())
                }
            }
            if let Some(requirement_type) = dep.requirement_type {
                write_field(&mut out, "requirementType", &requirement_type.to_string());
            }
            out.push('\n');
        }

        for prop in &self.properties {
            out.push_str("[ProductProperty]\n");
            match &prop.kind {
                PropertyKind::Unicode {
                    possible_values,
                    default_values,
                    editable,
                    multi_value,
                } => {
                    write_field(&mut out, "type", "unicode");
                    write_field(&mut out, "name", &prop.name);
                    write_field(&mut out, "multivalue", bool_str(*multi_value));
                    write_field(&mut out, "editable", bool_str(*editable));
                    write_field(&mut out, "description", &prop.description);
                    write_field(&mut out, "values", &json_list(possible_values));
                    write_field(&mut out, "default", &json_list(default_values));
                }
                PropertyKind::Bool { default } => {
                    write_field(&mut out, "type", "bool");
                    write_field(&mut out, "name", &prop.name);
                    write_field(&mut out, "description", &prop.description);
                    write_field(&mut out, "default", bool_str(*default));
                }
            }
            out.push('\n');
        }

        if !self.changelog.is_empty() {
            out.push_str("[Changelog]\n");
            out.push_str(&self.changelog);
            out.push('\n');
        }

        out
    }
}

/// Split the input into sections of fields, handling comments and continuations
fn split_sections(input: &str) -> Result<Vec<Section>> {
    let mut sections: Vec<Section> = Vec::new();
    // Whether indented lines continue the last field
    let mut open_field = false;

    for (idx, raw_line) in input.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.trim_end_matches('\r');
        let trimmed = line.trim();

        if let Some(header) = line
            .trim_end()
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
        {
            let kind = SectionKind::from_header(header);
            let in_changelog = sections
                .last()
                .map(|s| s.kind == SectionKind::Changelog)
                .unwrap_or(false);
            // Inside a changelog only known headers end the section
            if !in_changelog || kind != SectionKind::Unknown {
                sections.push(Section {
                    kind,
                    name: header.trim().to_string(),
                    line: line_no,
                    fields: Vec::new(),
                    raw: Vec::new(),
                });
                open_field = false;
                continue;
            }
        }

        let Some(section) = sections.last_mut() else {
            if trimmed.is_empty() || trimmed.starts_with(';') || trimmed.starts_with('#') {
                continue;
            }
            return Err(FleetpkgError::parse(line_no, "", "content before first section header"));
        };

        if section.kind == SectionKind::Changelog {
            section.raw.push(line.to_string());
            continue;
        }

        if open_field && line.starts_with(char::is_whitespace) {
            if let Some(field) = section.fields.last_mut() {
                field.value.push('\n');
                field.value.push_str(trimmed);
            }
            continue;
        }

        if let Some(field) = section.fields.last_mut() {
            let end = field.value.trim_end().len();
            field.value.truncate(end);
        }

        if trimmed.is_empty() {
            open_field = false;
            continue;
        }

        if trimmed.starts_with(';') || trimmed.starts_with('#') {
            continue;
        }

        let Some((key, value)) = line.split_once(':') else {
            return Err(FleetpkgError::parse(line_no, trimmed, "expected 'key: value'"));
        };
        let key = key.trim();
        if key.is_empty() || key.contains(char::is_whitespace) {
            return Err(FleetpkgError::parse(line_no, key, "invalid field name"));
        }

        section.fields.push(Field {
            key: key.to_lowercase(),
            value: value.trim().to_string(),
            line: line_no,
        });
        open_field = true;
    }

    for section in &mut sections {
        if let Some(field) = section.fields.last_mut() {
            let end = field.value.trim_end().len();
            field.value.truncate(end);
        }
    }

    Ok(sections)
}

fn parse_package(section: &Section) -> Result<PackageInfo> {
    let mut info = PackageInfo::default();

    if let Some(field) = section.get("version").filter(|f| !f.value.is_empty()) {
        validate_version(&field.value, field.line, "version")?;
        info.version = field.value.clone();
    }

    if let Some(field) = section.get("depends") {
        for item in split_list(&field.value) {
            let dep = item
                .parse::<PackageDependency>()
                .map_err(|e| FleetpkgError::parse(field.line, "depends", e))?;
            if !info.depends.iter().any(|d| d.package == dep.package) {
                info.depends.push(dep);
            }
        }
    }

    info.incremental = section.bool("incremental", "incremental")?;
    warn_unknown(section, &["version", "depends", "incremental"]);

    Ok(info)
}

fn parse_product(section: &Section) -> Result<Product> {
    let type_field = section.require("type", "type")?;
    let product_type: ProductType = type_field
        .value
        .parse()
        .map_err(|e: String| FleetpkgError::parse(type_field.line, "type", e))?;

    let id_field = section.require("id", "id")?;
    let id = id_field.value.to_lowercase();
    if !is_valid_product_id(&id) {
        return Err(FleetpkgError::parse(
            id_field.line,
            "id",
            format!("'{}' is not a valid product id", id_field.value),
        ));
    }

    let version_field = section.require("version", "version")?;
    validate_version(&version_field.value, version_field.line, "version")?;

    let mut product = Product::new(product_type, &id, &version_field.value, "1");
    product.name = section.optional("name").unwrap_or_default();
    product.description = section.value("description").unwrap_or_default().to_string();
    product.advice = section.value("advice").unwrap_or_default().to_string();
    product.license_required = section.bool("licenserequired", "licenseRequired")?;

    if let Some(field) = section.get("priority").filter(|f| !f.value.is_empty()) {
        let priority: i32 = field
            .value
            .parse()
            .map_err(|_| FleetpkgError::parse(field.line, "priority", "expected an integer"))?;
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
            return Err(FleetpkgError::parse(
                field.line,
                "priority",
                format!("must be between {} and {}", MIN_PRIORITY, MAX_PRIORITY),
            ));
        }
        product.priority = priority;
    }

    if let Some(classes) = section.value("productclasses") {
        product.product_class_ids = split_list(classes);
    }

    product.scripts = Scripts {
        setup: section.optional("setupscript"),
        uninstall: section.optional("uninstallscript"),
        update: section.optional("updatescript"),
        always: section.optional("alwaysscript"),
        once: section.optional("oncescript"),
        custom: section.optional("customscript"),
        user_login: section.optional("userloginscript"),
    };

    let template = section.optional("pxeconfigtemplate");
    if product_type == ProductType::Netboot {
        product.pxe_config_template = template;
    } else if template.is_some() {
        tracing::warn!("Ignoring pxeConfigTemplate of {} product {}", product_type, id);
    }

    warn_unknown(
        section,
        &[
            "type",
            "id",
            "name",
            "description",
            "advice",
            "version",
            "priority",
            "licenserequired",
            "productclasses",
            "setupscript",
            "uninstallscript",
            "updatescript",
            "alwaysscript",
            "oncescript",
            "customscript",
            "userloginscript",
            "pxeconfigtemplate",
        ],
    );

    Ok(product)
}

fn parse_dependency(section: &Section, product: &Product) -> Result<ProductDependency> {
    let action_field = section.require("action", "action")?;
    let action: ActionRequest = action_field
        .value
        .parse()
        .map_err(|e: String| FleetpkgError::parse(action_field.line, "action", e))?;

    let target = match (
        section.optional("requiredproduct"),
        section.optional("requiredproductclass"),
    ) {
        (Some(id), None) => DependencyTarget::Product(id.to_lowercase()),
        (None, Some(class)) => DependencyTarget::ProductClass(class),
        (Some(_), Some(_)) => {
            return Err(FleetpkgError::parse(
                section.line,
                "requiredProduct",
                "requiredProduct and requiredProductClass are mutually exclusive",
            ))
        }
        (None, None) => {
            return Err(FleetpkgError::parse(
                section.line,
                "requiredProduct",
                "one of requiredProduct or requiredProductClass is required",
            ))
        }
    };

    let requirement = match (section.get("requiredaction"), section.get("requiredstatus")) {
        (Some(f), None) if !f.value.is_empty() => Requirement::Action(
            f.value
                .parse()
                .map_err(|e: String| FleetpkgError::parse(f.line, "requiredAction", e))?,
        ),
        (None, Some(f)) if !f.value.is_empty() => Requirement::Status(
            f.value
                .parse::<InstallationStatus>()
                .map_err(|e| FleetpkgError::parse(f.line, "requiredStatus", e))?,
        ),
        (Some(_), Some(_)) => {
            return Err(FleetpkgError::parse(
                section.line,
                "requiredAction",
                "requiredAction and requiredStatus are mutually exclusive",
            ))
        }
        _ => {
            return Err(FleetpkgError::parse(
                section.line,
                "requiredAction",
                "one of requiredAction or requiredStatus is required",
            ))
        }
    };

    let requirement_type = match section.get("requirementtype").filter(|f| !f.value.is_empty()) {
        Some(f) => Some(
            f.value
                .parse::<RequirementType>()
                .map_err(|e| FleetpkgError::parse(f.line, "requirementType", e))?,
        ),
        None => None,
    };

    warn_unknown(
        section,
        &[
            "action",
            "requiredproduct",
            "requiredproductclass",
            "requiredaction",
            "requiredstatus",
            "requirementtype",
        ],
    );

    Ok(ProductDependency {
        product_id: product.id.clone(),
        product_version: product.product_version.clone(),
        package_version: product.package_version.clone(),
        action,
        target,
        requirement,
        requirement_type,
    })
}

fn parse_property(section: &Section, product: &Product) -> Result<ProductProperty> {
    let name = section.require("name", "name")?.value.clone();
    let description = section.value("description").unwrap_or_default().to_string();

    let type_name = section
        .value("type")
        .map(|t| t.to_lowercase())
        .unwrap_or_else(|| "unicode".to_string());

    let kind = match type_name.as_str() {
        "bool" | "boolproductproperty" => {
            let default = match section.get("default").filter(|f| !f.value.is_empty()) {
                Some(f) => {
                    let values = parse_values(&f.value, f.line, "default")?;
                    match values.as_slice() {
                        [] => false,
                        [v] => parse_bool(v).ok_or_else(|| {
                            FleetpkgError::parse(f.line, "default", "expected a boolean")
                        })?,
                        _ => {
                            return Err(FleetpkgError::parse(
                                f.line,
                                "default",
                                "bool property takes a single default",
                            ))
                        }
                    }
                }
                None => false,
            };
            PropertyKind::Bool { default }
        }
        "unicode" | "unicodeproductproperty" => {
            let possible_values = match section.get("values") {
                Some(f) => parse_values(&f.value, f.line, "values")?,
                None => Vec::new(),
            };
            let default_values = match section.get("default") {
                Some(f) => parse_values(&f.value, f.line, "default")?,
                None => Vec::new(),
            };
            PropertyKind::Unicode {
                possible_values,
                default_values,
                editable: section.bool("editable", "editable")?,
                multi_value: section.bool("multivalue", "multivalue")?,
            }
        }
        other => {
            let line = section.get("type").map(|f| f.line).unwrap_or(section.line);
            return Err(FleetpkgError::parse(
                line,
                "type",
                format!("unknown property type '{}'", other),
            ));
        }
    };

    let property = ProductProperty {
        product_id: product.id.clone(),
        product_version: product.product_version.clone(),
        package_version: product.package_version.clone(),
        name,
        description,
        kind,
    };

    property
        .validate_defaults(&property.default_values())
        .map_err(|e| {
            let line = section.get("default").map(|f| f.line).unwrap_or(section.line);
            FleetpkgError::parse(line, "default", e)
        })?;

    warn_unknown(
        section,
        &["type", "name", "description", "values", "default", "editable", "multivalue"],
    );

    Ok(property)
}

fn warn_unknown(section: &Section, known: &[&str]) {
    for field in &section.fields {
        if !known.contains(&field.key.as_str()) {
            tracing::warn!(
                "Ignoring unknown field '{}' in [{}] at line {}",
                field.key,
                section.name,
                field.line
            );
        }
    }
}

/// Comma- or newline-separated list, trimmed and de-duplicated
fn split_list(value: &str) -> Vec<String> {
    dedup(
        value
            .split(|c| c == ',' || c == '\n')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
    )
}

/// Property value list: a JSON array literal or a plain list
fn parse_values(value: &str, line: usize, field: &str) -> Result<Vec<String>> {
    let trimmed = value.trim();
    if !trimmed.starts_with('[') {
        return Ok(split_list(trimmed));
    }

    let items: Vec<serde_json::Value> = serde_json::from_str(trimmed)
        .map_err(|e| FleetpkgError::parse(line, field, format!("invalid list: {}", e)))?;

    Ok(dedup(
        items
            .into_iter()
            .map(|v| match v {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            })
            .collect(),
    ))
}

fn dedup(items: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.clone()))
        .collect()
}

fn json_list(values: &[String]) -> String {
    let items: Vec<String> = values
        .iter()
        .map(|v| serde_json::Value::String(v.clone()).to_string())
        .collect();
    format!("[{}]", items.join(","))
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "yes" | "1" | "on" => Some(true),
        "false" | "no" | "0" | "off" => Some(false),
        _ => None,
    }
}

fn bool_str(value: bool) -> &'static str {
    if value {
        "True"
    } else {
        "False"
    }
}

fn write_field(out: &mut String, key: &str, value: &str) {
    out.push_str(key);
    out.push(':');
    let mut lines = value.split('\n');
    if let Some(first) = lines.next() {
        if !first.is_empty() {
            out.push(' ');
            out.push_str(first);
        }
    }
    out.push('\n');
    for line in lines {
        out.push(' ');
        out.push_str(line);
        out.push('\n');
    }
}

/// Product ids are lowercase `[a-z0-9._-]+`
pub fn is_valid_product_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'))
}

fn validate_version(version: &str, line: usize, field: &str) -> Result<()> {
    if version.is_empty()
        || version
            .chars()
            .any(|c| c == '-' || c == '_' || c.is_whitespace())
    {
        return Err(FleetpkgError::parse(
            line,
            field,
            format!("'{}' is not a valid version", version),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"; sample control file
[Package]
version: 3
depends: base-tools (>= 1.0-1), hotfix, base-tools
incremental: False

[Product]
type: localboot
id: Firefox
name: Mozilla Firefox
description: Web browser
 with a second line
advice:
version: 115.0
priority: 10
licenseRequired: False
productClasses: browser, web, browser
setupScript: setup.ins
uninstallScript: uninstall.ins

[Windows]
softwareIds: {ec8030f7}, firefox

[ProductDependency]
action: setup
requiredProduct: vcredist
requiredStatus: installed
requirementType: before

[ProductDependency]
action: uninstall
requiredProductClass: plugins
requiredAction: uninstall

[ProductProperty]
type: unicode
name: language
multivalue: False
editable: False
description: UI language
values: de, en, fr
default: en

[ProductProperty]
type: bool
name: desktop_icon
description: create icon
default: True

[Changelog]
firefox (115.0-3)
  # not a comment here
  * update
"#;

    #[test]
    fn test_parse_sample() {
        let control = ControlFile::parse(SAMPLE).unwrap();

        assert_eq!(control.package.version, "3");
        assert_eq!(control.package.depends.len(), 2);
        assert_eq!(control.package.depends[0].package, "base-tools");

        let product = &control.product;
        assert_eq!(product.id, "firefox");
        assert_eq!(product.product_version, "115.0");
        assert_eq!(product.package_version, "3");
        assert_eq!(product.priority, 10);
        assert_eq!(product.description, "Web browser\nwith a second line");
        assert_eq!(product.advice, "");
        assert_eq!(product.product_class_ids, vec!["browser", "web"]);
        assert_eq!(product.scripts.setup.as_deref(), Some("setup.ins"));
        assert!(product.scripts.update.is_none());
        assert_eq!(product.windows_software_ids, vec!["{ec8030f7}", "firefox"]);

        assert_eq!(control.dependencies.len(), 2);
        let dep = &control.dependencies[0];
        assert_eq!(dep.product_id, "firefox");
        assert_eq!(dep.package_version, "3");
        assert_eq!(dep.target, DependencyTarget::Product("vcredist".to_string()));
        assert_eq!(dep.requirement, Requirement::Status(InstallationStatus::Installed));
        assert_eq!(dep.requirement_type, Some(RequirementType::Before));
        assert_eq!(
            control.dependencies[1].target,
            DependencyTarget::ProductClass("plugins".to_string())
        );

        assert_eq!(control.properties.len(), 2);
        assert_eq!(control.properties[0].default_values(), vec!["en"]);
        assert_eq!(control.properties[1].kind, PropertyKind::Bool { default: true });

        assert!(control.changelog.contains("# not a comment here"));
    }

    #[test]
    fn test_round_trip_is_stable() {
        let first = ControlFile::parse(SAMPLE).unwrap();
        let text = first.serialize();
        let second = ControlFile::parse(&text).unwrap();
        assert_eq!(first, second);
        assert_eq!(text, second.serialize());
    }

    #[test]
    fn test_values_with_commas_survive_round_trip() {
        let input = "[Product]\ntype: localboot\nid: p\nversion: 1.0\n\n[ProductProperty]\nname: args\nmultivalue: True\nvalues: [\"a,b\", \"c\"]\ndefault: [\"a,b\"]\n";
        let first = ControlFile::parse(input).unwrap();
        assert_eq!(first.properties[0].possible_values(), vec!["a,b", "c"]);
        let second = ControlFile::parse(&first.serialize()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_missing_product_id_reports_line_and_field() {
        let input = "[Package]\nversion: 1\n\n[Product]\ntype: localboot\nversion: 1.0\n";
        match ControlFile::parse(input) {
            Err(FleetpkgError::Parse { line, field, .. }) => {
                assert_eq!(line, 4);
                assert_eq!(field, "id");
            }
            other => panic!("expected parse error, got {:?}", other),
        }
    }

    #[test]
    fn test_package_version_defaults_to_one() {
        let input = "[Product]\ntype: netboot\nid: win10\nversion: 10.0\npxeConfigTemplate: install\n";
        let control = ControlFile::parse(input).unwrap();
        assert_eq!(control.package.version, "1");
        assert_eq!(control.product.package_version, "1");
        assert_eq!(control.product.pxe_config_template.as_deref(), Some("install"));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let bad_priority = "[Product]\ntype: localboot\nid: p\nversion: 1.0\npriority: 500\n";
        assert!(matches!(
            ControlFile::parse(bad_priority),
            Err(FleetpkgError::Parse { line: 5, .. })
        ));

        let bad_default = "[Product]\ntype: localboot\nid: p\nversion: 1.0\n\n[ProductProperty]\nname: x\nvalues: a, b\ndefault: c\n";
        assert!(matches!(
            ControlFile::parse(bad_default),
            Err(FleetpkgError::Parse { line: 9, .. })
        ));

        let both_targets = "[Product]\ntype: localboot\nid: p\nversion: 1.0\n\n[ProductDependency]\naction: setup\nrequiredProduct: a\nrequiredProductClass: b\nrequiredAction: setup\n";
        assert!(ControlFile::parse(both_targets).is_err());

        let bad_version = "[Product]\ntype: localboot\nid: p\nversion: 1.0-2\n";
        assert!(ControlFile::parse(bad_version).is_err());
    }

    #[test]
    fn test_json_list_escapes_values() {
        let values = vec!["de".to_string(), "say \"hi\" \\ bye".to_string()];
        let text = json_list(&values);
        assert_eq!(text, r#"["de","say \"hi\" \\ bye"]"#);
        assert_eq!(serde_json::from_str::<Vec<String>>(&text).unwrap(), values);
        assert_eq!(json_list(&[]), "[]");
    }
}
