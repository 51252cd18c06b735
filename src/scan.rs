use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;
use zip::ZipArchive;

use crate::hierarchy::ClassTable;
use crate::ir::{MethodBody, MethodKey, ProgramDump};

/// Method bodies and hierarchy facts collected from every program dump.
#[derive(Debug, Default)]
pub(crate) struct ScanOutput {
    pub(crate) bodies: BTreeMap<MethodKey, MethodBody>,
    /// Class to the classes directly extending or implementing it.
    pub(crate) deriving: ClassTable,
    pub(crate) class_count: usize,
    pub(crate) dump_count: usize,
}

pub(crate) fn scan_inputs(input: &Path) -> Result<ScanOutput> {
    let mut output = ScanOutput::default();
    scan_path(input, true, &mut output)?;
    debug!(
        dumps = output.dump_count,
        classes = output.class_count,
        methods = output.bodies.len(),
        "scanned program"
    );
    Ok(output)
}

fn scan_path(path: &Path, strict: bool, output: &mut ScanOutput) -> Result<()> {
    if path.is_dir() {
        return scan_dir(path, output);
    }

    let extension = path.extension().and_then(|ext| ext.to_str()).unwrap_or("");
    match extension {
        "json" => scan_json_file(path, output),
        "zip" if strict => scan_zip_file(path, output),
        _ => {
            if strict {
                anyhow::bail!("unsupported input file: {}", path.display())
            } else {
                Ok(())
            }
        }
    }
}

fn scan_dir(path: &Path, output: &mut ScanOutput) -> Result<()> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(path)
        .with_context(|| format!("failed to read directory {}", path.display()))?
    {
        let entry = entry.with_context(|| format!("failed to read entry under {}", path.display()))?;
        entries.push(entry.path());
    }

    // Keep deterministic ordering by sorting directory listings.
    entries.sort_by_key(|entry| path_key(entry));

    for entry in entries {
        if entry.is_dir() {
            scan_dir(&entry, output)?;
        } else {
            scan_path(&entry, false, output)?;
        }
    }

    Ok(())
}

fn scan_json_file(path: &Path, output: &mut ScanOutput) -> Result<()> {
    let data = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let dump: ProgramDump = serde_json::from_slice(&data)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    absorb(dump, output);
    Ok(())
}

fn scan_zip_file(path: &Path, output: &mut ScanOutput) -> Result<()> {
    let file = fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut archive =
        ZipArchive::new(file).with_context(|| format!("failed to read {}", path.display()))?;

    let mut entry_names = Vec::new();
    for index in 0..archive.len() {
        let entry = archive
            .by_index(index)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        if name.ends_with(".json") {
            entry_names.push(name);
        }
    }

    entry_names.sort();

    for name in entry_names {
        let mut entry = archive
            .by_name(&name)
            .with_context(|| format!("failed to read {}:{}", path.display(), name))?;
        let mut data = Vec::new();
        entry
            .read_to_end(&mut data)
            .with_context(|| format!("failed to read {}:{}", path.display(), name))?;
        let dump: ProgramDump = serde_json::from_slice(&data)
            .with_context(|| format!("failed to parse {}:{}", path.display(), name))?;
        absorb(dump, output);
    }

    Ok(())
}

fn absorb(dump: ProgramDump, output: &mut ScanOutput) {
    output.dump_count += 1;
    for class in dump.classes {
        output.class_count += 1;
        for parent in class.super_name.iter().chain(class.interfaces.iter()) {
            output
                .deriving
                .entry(parent.clone())
                .or_default()
                .insert(class.name.clone());
        }
        for method in class.methods {
            let key = MethodKey::new(class.name.as_str(), method.signature);
            let body = MethodBody::from_records(&method.instructions);
            if output.bodies.insert(key.clone(), body).is_some() {
                debug!(method = %key, "duplicate method definition, keeping the last");
            }
        }
    }
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::io::Write;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    const SAMPLE: &str = r##"{
        "classes": [{
            "name": "t/Sample",
            "super_name": "t/Base",
            "interfaces": ["t/Runner"],
            "methods": [{
                "signature": "run:()V",
                "instructions": [
                    {"offset": 0, "opcode": "invokestatic", "operands": ["#2"],
                     "comment": "// Method t/Util.log:()V"},
                    {"offset": 3, "opcode": "return"}
                ]
            }]
        }]
    }"##;

    fn dump(class: &str, method: &str) -> String {
        format!(
            r#"{{"classes": [{{"name": "{class}", "methods": [{{"signature": "{method}",
                "instructions": [{{"offset": 0, "opcode": "return"}}]}}]}}]}}"#
        )
    }

    #[test]
    fn scan_inputs_reads_single_dump() {
        let temp_dir = tempfile::tempdir().expect("create temp dir");
        let path = temp_dir.path().join("sample.json");
        fs::write(&path, SAMPLE).expect("write dump");

        let result = scan_inputs(&path).expect("scan dump");

        assert_eq!(1, result.class_count);
        let body = result
            .bodies
            .get(&MethodKey::new("t/Sample", "run:()V"))
            .expect("method body");
        assert_eq!(4, body.len());
        assert_eq!(
            Some(&BTreeSet::from(["t/Sample".to_string()])),
            result.deriving.get("t/Runner")
        );
        assert!(result.deriving.contains_key("t/Base"));
    }

    #[test]
    fn scan_inputs_walks_directories_in_sorted_order() {
        let temp_dir = tempfile::tempdir().expect("create temp dir");
        let nested = temp_dir.path().join("nested");
        fs::create_dir_all(&nested).expect("create nested dir");
        fs::write(nested.join("b.json"), dump("t/A", "m:()V")).expect("write b");
        fs::write(temp_dir.path().join("a.json"), dump("t/A", "m:()V")).expect("write a");
        fs::write(temp_dir.path().join("notes.txt"), "ignored").expect("write notes");

        let result = scan_inputs(temp_dir.path()).expect("scan dir");

        assert_eq!(2, result.dump_count);
        assert_eq!(1, result.bodies.len());
    }

    #[test]
    fn scan_inputs_reads_json_entries_of_zip() {
        let temp_dir = tempfile::tempdir().expect("create temp dir");
        let path = temp_dir.path().join("dumps.zip");
        let file = fs::File::create(&path).expect("create zip");
        let mut writer = ZipWriter::new(file);
        let options = SimpleFileOptions::default();
        writer.start_file("one.json", options).expect("start one");
        writer
            .write_all(dump("t/A", "a:()V").as_bytes())
            .expect("write one");
        writer.start_file("README", options).expect("start readme");
        writer.write_all(b"skip me").expect("write readme");
        writer.start_file("two.json", options).expect("start two");
        writer
            .write_all(dump("t/B", "b:()V").as_bytes())
            .expect("write two");
        writer.finish().expect("finish zip");

        let result = scan_inputs(&path).expect("scan zip");

        let keys: Vec<String> = result.bodies.keys().map(ToString::to_string).collect();
        assert_eq!(vec!["t/A.a:()V", "t/B.b:()V"], keys);
        assert_eq!(2, result.dump_count);
    }

    #[test]
    fn scan_inputs_rejects_unsupported_and_invalid_files() {
        let temp_dir = tempfile::tempdir().expect("create temp dir");
        let text = temp_dir.path().join("program.txt");
        fs::write(&text, "nope").expect("write text");
        let broken = temp_dir.path().join("broken.json");
        fs::write(&broken, "{ not json").expect("write broken");

        assert!(scan_inputs(&text).is_err());
        let err = scan_inputs(&broken).expect_err("invalid json");
        assert!(format!("{err:#}").contains("broken.json"));
    }
}
