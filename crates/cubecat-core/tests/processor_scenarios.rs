//! End-to-end scenarios driving the public `process_slices` facade:
//! cube creation, appends, validation failures, crash recovery, lock
//! contention, and attribute handling.

use std::collections::BTreeMap;

use cubecat_core::dataset::array::unpack;
use cubecat_core::lock::{LockInfo, TargetLock};
use cubecat_core::transaction::{Transaction, TxnKind};
use cubecat_core::zarr;
use cubecat_core::{
    Array, Config, Dataset, DataType, Error, FileObj, Processor, SliceHandle, Variable,
};

fn mem_root(tag: &str) -> FileObj {
    FileObj::new(
        format!("memory://scenarios/{}-{}", tag, uuid_like()),
        None,
    )
    .unwrap()
}

fn uuid_like() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    format!(
        "{}-{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::SeqCst)
    )
}

fn config_json(root: &FileObj, extra: serde_json::Value) -> Config {
    let mut value = serde_json::json!({
        "target_dir": root.child("t.cube").uri(),
        "append_dim": "t",
        "temp_dir": root.child("tmp").uri(),
    });
    if let (Some(base), Some(more)) = (value.as_object_mut(), extra.as_object()) {
        for (k, v) in more {
            base.insert(k.clone(), v.clone());
        }
    }
    Config::from_value(value).unwrap()
}

/// A slice with an i64 `t` coordinate and a float32 `v(t, y, x)` whose
/// values encode the label, so appended content is distinguishable.
fn make_slice(labels: &[i64]) -> Dataset {
    let n = labels.len();
    let mut ds = Dataset::new();
    ds.add_variable(
        "t",
        Variable::new(
            vec!["t".to_string()],
            Array::from_vec(vec![n], labels.to_vec()).unwrap(),
        ),
    )
    .unwrap();
    let values: Vec<f32> = labels
        .iter()
        .flat_map(|&label| (0..16).map(move |i| label as f32 * 100.0 + i as f32))
        .collect();
    ds.add_variable(
        "v",
        Variable::new(
            vec!["t".to_string(), "y".to_string(), "x".to_string()],
            Array::from_vec(vec![n, 4, 4], values).unwrap(),
        ),
    )
    .unwrap();
    ds
}

/// Recursively collect every file under a directory.
fn tree(dir: &FileObj) -> BTreeMap<String, Vec<u8>> {
    fn walk(dir: &FileObj, prefix: &str, out: &mut BTreeMap<String, Vec<u8>>) {
        for entry in dir.list().unwrap() {
            let name = format!("{prefix}{}", entry.filename());
            if entry.is_dir().unwrap() {
                walk(&entry, &format!("{name}/"), out);
            } else {
                out.insert(name, entry.read().unwrap());
            }
        }
    }
    let mut out = BTreeMap::new();
    if dir.exists().unwrap() {
        walk(dir, "", &mut out);
    }
    out
}

fn lock_absent(root: &FileObj) -> bool {
    !TargetLock::lock_file(&root.child("t.cube")).exists().unwrap()
}

fn temp_empty(root: &FileObj) -> bool {
    let tmp = root.child("tmp");
    !tmp.exists().unwrap() || tmp.list().unwrap().is_empty()
}

#[test]
fn test_create_cube_from_first_slice() {
    let root = mem_root("create");
    let config = config_json(&root, serde_json::json!({}));
    cubecat_core::process_slices([SliceHandle::from(make_slice(&[0]))], config).unwrap();

    let cube = root.child("t.cube");
    assert!(zarr::read::is_cube(&cube).unwrap());

    let (schema, values) = zarr::read::read_variable_values(&cube, "v").unwrap();
    assert_eq!(schema.chunks, vec![1, 4, 4]);
    assert_eq!(schema.dtype, DataType::Float32);
    assert_eq!(values.shape(), &[1, 4, 4]);

    let (_, labels) = zarr::read::read_variable_values(&cube, "t").unwrap();
    assert_eq!(labels.elems::<i64>().unwrap(), vec![0]);

    assert!(lock_absent(&root));
    assert!(temp_empty(&root));
}

#[test]
fn test_append_extends_cube_and_coordinate() {
    let root = mem_root("append");
    let config = config_json(&root, serde_json::json!({}));
    let processor = Processor::new(config).unwrap();
    processor
        .process_slices([make_slice(&[0]), make_slice(&[1])])
        .unwrap();

    let cube = root.child("t.cube");
    let state = zarr::read::read_state(&cube, "t").unwrap();
    assert_eq!(state.append_size, 2);
    assert_eq!(state.append_labels, vec![0.0, 1.0]);

    let (_, values) = zarr::read::read_variable_values(&cube, "v").unwrap();
    assert_eq!(values.shape(), &[2, 4, 4]);
    let decoded = values.elems::<f32>().unwrap();
    assert_eq!(decoded[0], 0.0);
    assert_eq!(decoded[16], 100.0);
    assert_eq!(decoded[31], 115.0);

    assert!(lock_absent(&root));
    assert!(temp_empty(&root));
}

#[test]
fn test_round_trip_label_concatenation() {
    let root = mem_root("roundtrip");
    let config = config_json(&root, serde_json::json!({}));
    let slices: Vec<Dataset> = (0..5).map(|i| make_slice(&[i * 10])).collect();
    cubecat_core::process_slices(slices, config).unwrap();

    let state = zarr::read::read_state(&root.child("t.cube"), "t").unwrap();
    assert_eq!(state.append_labels, vec![0.0, 10.0, 20.0, 30.0, 40.0]);
}

#[test]
fn test_bad_append_size_leaves_cube_unchanged() {
    let root = mem_root("badshape");
    let config = config_json(&root, serde_json::json!({}));
    let processor = Processor::new(config).unwrap();
    processor.process_slices([make_slice(&[0])]).unwrap();
    let snapshot = tree(&root.child("t.cube"));

    let err = processor
        .process_slices([make_slice(&[1, 2])])
        .unwrap_err();
    assert!(matches!(err, Error::SliceShape(_)));

    assert_eq!(tree(&root.child("t.cube")), snapshot);
    assert!(lock_absent(&root));
    assert!(temp_empty(&root));
}

#[test]
fn test_missing_variable_fails_validation() {
    let root = mem_root("missingvar");
    let config = config_json(&root, serde_json::json!({}));
    let processor = Processor::new(config).unwrap();
    processor.process_slices([make_slice(&[0])]).unwrap();

    let mut slice = make_slice(&[1]);
    slice.variables.remove("v");
    let err = processor.process_slices([slice]).unwrap_err();
    assert!(matches!(err, Error::SliceSchema(_)));
    assert!(lock_absent(&root));
}

#[test]
fn test_extra_variables_are_silently_dropped() {
    let root = mem_root("extravar");
    let config = config_json(&root, serde_json::json!({}));
    let processor = Processor::new(config).unwrap();
    processor.process_slices([make_slice(&[0])]).unwrap();

    let mut slice = make_slice(&[1]);
    slice
        .add_variable(
            "w",
            Variable::new(
                vec!["t".to_string()],
                Array::from_vec(vec![1], vec![9i64]).unwrap(),
            ),
        )
        .unwrap();
    processor.process_slices([slice]).unwrap();

    let cube = root.child("t.cube");
    assert!(!cube.child("w").exists().unwrap());
    let state = zarr::read::read_state(&cube, "t").unwrap();
    assert_eq!(state.append_size, 2);
}

#[test]
fn test_append_step_violation() {
    let root = mem_root("step");
    let config = config_json(&root, serde_json::json!({"append_step": "+"}));
    let processor = Processor::new(config).unwrap();
    processor.process_slices([make_slice(&[5])]).unwrap();

    let err = processor.process_slices([make_slice(&[3])]).unwrap_err();
    assert!(matches!(err, Error::AppendOrder(_)));

    let state = zarr::read::read_state(&root.child("t.cube"), "t").unwrap();
    assert_eq!(state.append_labels, vec![5.0]);
    assert!(lock_absent(&root));
}

#[test]
fn test_exact_step_accepted() {
    let root = mem_root("exactstep");
    let config = config_json(&root, serde_json::json!({"append_step": 1}));
    let processor = Processor::new(config).unwrap();
    processor
        .process_slices([make_slice(&[0]), make_slice(&[1]), make_slice(&[2])])
        .unwrap();
    let state = zarr::read::read_state(&root.child("t.cube"), "t").unwrap();
    assert_eq!(state.append_labels, vec![0.0, 1.0, 2.0]);
}

#[test]
fn test_crash_recovery_restores_previous_state() {
    let root = mem_root("crash");
    let config = config_json(&root, serde_json::json!({}));
    let processor = Processor::new(config.clone()).unwrap();
    processor
        .process_slices([make_slice(&[0]), make_slice(&[1])])
        .unwrap();

    let cube = root.child("t.cube");
    let temp = root.child("tmp");
    let snapshot = tree(&cube);

    // Fabricate a transaction killed mid-append: journalled mutations
    // applied, no commit marker, lock owned by a dead process.
    let txn = Transaction::begin(
        TxnKind::Append,
        &cube,
        &temp,
        None,
        false,
        Some(2),
        &Default::default(),
    )
    .unwrap();
    let zarray = cube.child("v").child(".zarray");
    txn.journal_replace(&zarray).unwrap();
    zarray.write(b"{\"broken\": true}").unwrap();
    let chunk = cube.child("v").child("2.0.0");
    txn.journal_added(&chunk, false).unwrap();
    chunk.write(b"partial chunk bytes").unwrap();
    let coord_chunk = cube.child("t").child("2");
    txn.journal_added(&coord_chunk, false).unwrap();
    coord_chunk.write(b"partial").unwrap();
    std::mem::forget(txn);

    let lock_file = TargetLock::lock_file(&cube);
    let mut info: LockInfo = lock_file.read_json().unwrap();
    info.pid = u32::MAX - 1;
    lock_file.write_json(&info).unwrap();

    // A fresh run with no slices recovers: cube bit-identical to the
    // post-slice-1 state, lock absent, temp dir empty.
    let restarted = Processor::new(config).unwrap();
    restarted.process_slices(Vec::<SliceHandle>::new()).unwrap();
    assert_eq!(tree(&cube), snapshot);
    assert!(lock_absent(&root));
    assert!(temp_empty(&root));

    // The cube is still appendable afterwards
    restarted.process_slices([make_slice(&[2])]).unwrap();
    let state = zarr::read::read_state(&cube, "t").unwrap();
    assert_eq!(state.append_labels, vec![0.0, 1.0, 2.0]);
}

#[test]
fn test_contention_fail_fast_and_wait() {
    let root = mem_root("contention");
    let config = config_json(&root, serde_json::json!({}));
    let processor = Processor::new(config).unwrap();
    processor.process_slices([make_slice(&[0])]).unwrap();

    // A live writer holds the lock
    let cube = root.child("t.cube");
    TargetLock::lock_file(&cube)
        .write_json(&LockInfo {
            pid: std::process::id(),
            host: "somewhere-else".to_string(),
            start_time: String::new(),
            txn_dir: None,
        })
        .unwrap();

    let err = processor.process_slices([make_slice(&[1])]).unwrap_err();
    assert!(matches!(err, Error::TargetLocked(_)));

    // Wait mode keeps retrying until the timeout
    let config = config_json(
        &root,
        serde_json::json!({"slice_polling": {"interval": 0.02, "timeout": 0.1}}),
    );
    let waiting = Processor::new(config).unwrap();
    let start = std::time::Instant::now();
    let err = waiting.process_slices([make_slice(&[1])]).unwrap_err();
    assert!(matches!(err, Error::TargetLocked(_)));
    assert!(start.elapsed() >= std::time::Duration::from_millis(100));

    TargetLock::lock_file(&cube).delete(false).unwrap();
}

#[test]
fn test_empty_slice_sequence_is_a_no_op() {
    let root = mem_root("noop");
    let config = config_json(&root, serde_json::json!({}));
    let processor = Processor::new(config).unwrap();
    processor.process_slices([make_slice(&[0])]).unwrap();
    let snapshot = tree(&root.child("t.cube"));

    processor.process_slices(Vec::<SliceHandle>::new()).unwrap();
    assert_eq!(tree(&root.child("t.cube")), snapshot);
}

#[test]
fn test_force_new_replaces_cube_and_stale_lock() {
    let root = mem_root("forcenew");
    let config = config_json(&root, serde_json::json!({}));
    cubecat_core::process_slices([make_slice(&[0]), make_slice(&[1])], config).unwrap();

    let cube = root.child("t.cube");
    TargetLock::lock_file(&cube)
        .write(b"stale lock content")
        .unwrap();

    let config = config_json(&root, serde_json::json!({"force_new": true}));
    cubecat_core::process_slices([make_slice(&[7])], config).unwrap();

    let state = zarr::read::read_state(&cube, "t").unwrap();
    assert_eq!(state.append_size, 1);
    assert_eq!(state.append_labels, vec![7.0]);
    assert!(lock_absent(&root));
}

#[test]
fn test_dry_run_writes_nothing() {
    let root = mem_root("dryrun");
    let config = config_json(&root, serde_json::json!({"dry_run": true}));
    cubecat_core::process_slices([make_slice(&[0])], config).unwrap();

    assert!(!root.child("t.cube").exists().unwrap());
    assert!(lock_absent(&root));
    assert!(temp_empty(&root));
}

#[test]
fn test_packed_encoding_round_trip() {
    let root = mem_root("packing");
    let config = config_json(
        &root,
        serde_json::json!({
            "variables": {
                "v": {"encoding": {
                    "dtype": "int16",
                    "scale_factor": 0.5,
                    "add_offset": 0.0,
                    "fill_value": -9999,
                    "compressor": "zlib"
                }}
            }
        }),
    );
    cubecat_core::process_slices([make_slice(&[0]), make_slice(&[1])], config).unwrap();

    let cube = root.child("t.cube");
    let (schema, stored) = zarr::read::read_variable_values(&cube, "v").unwrap();
    assert_eq!(schema.dtype, DataType::Int16);
    assert_eq!(stored.shape(), &[2, 4, 4]);

    let decoded = unpack(
        &stored,
        schema.scale_factor,
        schema.add_offset,
        Some(schema.fill_value),
    );
    let values = decoded.elems::<f64>().unwrap();
    assert_eq!(values[0], 0.0);
    assert_eq!(values[16], 100.0);
    assert_eq!(values[31], 115.0);
}

#[test]
fn test_group_attrs_update_modes() {
    let root = mem_root("attrs");
    let mut slice0 = make_slice(&[0]);
    slice0
        .attrs
        .insert("title".to_string(), serde_json::json!("first"));
    slice0
        .attrs
        .insert("source".to_string(), serde_json::json!("sensor-a"));
    let config = config_json(&root, serde_json::json!({}));
    cubecat_core::process_slices([slice0], config).unwrap();

    let cube = root.child("t.cube");
    let attrs = zarr::read::read_group_attrs(&cube).unwrap();
    assert_eq!(attrs.get("title"), Some(&serde_json::json!("first")));

    // "keep": the slice's new attributes are ignored
    let mut slice1 = make_slice(&[1]);
    slice1
        .attrs
        .insert("title".to_string(), serde_json::json!("second"));
    let config = config_json(&root, serde_json::json!({"attrs_update_mode": "keep"}));
    cubecat_core::process_slices([slice1], config).unwrap();
    let attrs = zarr::read::read_group_attrs(&cube).unwrap();
    assert_eq!(attrs.get("title"), Some(&serde_json::json!("first")));

    // "replace" is whole-object: keys not in the slice are dropped
    let mut slice2 = make_slice(&[2]);
    slice2
        .attrs
        .insert("title".to_string(), serde_json::json!("third"));
    let config = config_json(&root, serde_json::json!({"attrs_update_mode": "replace"}));
    cubecat_core::process_slices([slice2], config).unwrap();
    let attrs = zarr::read::read_group_attrs(&cube).unwrap();
    assert_eq!(attrs.get("title"), Some(&serde_json::json!("third")));
    assert!(!attrs.contains_key("source"));
}

#[test]
fn test_attr_expressions_track_append_bounds() {
    let root = mem_root("eval");
    let config = config_json(
        &root,
        serde_json::json!({
            "permit_eval": true,
            "attrs": {
                "time_min": "{{ lower_bound(t, \"lower\") }}",
                "time_max": "{{ upper_bound(t, \"upper\") }}"
            }
        }),
    );
    let processor = Processor::new(config).unwrap();
    processor
        .process_slices([make_slice(&[10]), make_slice(&[11]), make_slice(&[12])])
        .unwrap();

    let attrs = zarr::read::read_group_attrs(&root.child("t.cube")).unwrap();
    assert_eq!(attrs.get("time_min"), Some(&serde_json::json!(10.0)));
    assert_eq!(attrs.get("time_max"), Some(&serde_json::json!(12.0)));
}

#[test]
fn test_eval_requires_permit() {
    let root = mem_root("evaloff");
    let config = config_json(
        &root,
        serde_json::json!({"attrs": {"x": "{{ lower_bound(t) }}"}}),
    );
    let err = cubecat_core::process_slices([make_slice(&[0])], config).unwrap_err();
    assert!(err.to_string().contains("permit_eval"));
    // The failed creation rolled back completely
    assert!(!root.child("t.cube").exists().unwrap());
    assert!(lock_absent(&root));
}

#[test]
fn test_local_filesystem_cube() {
    let dir = tempfile::TempDir::new().unwrap();
    let target = dir.path().join("t.cube");
    let config = Config::from_value(serde_json::json!({
        "target_dir": target.to_str().unwrap(),
        "append_dim": "t",
        "temp_dir": dir.path().join("tmp").to_str().unwrap(),
    }))
    .unwrap();

    cubecat_core::process_slices([make_slice(&[0]), make_slice(&[1])], config).unwrap();

    assert!(target.join(".zgroup").is_file());
    assert!(target.join(".zmetadata").is_file());
    assert!(target.join("v").join(".zarray").is_file());
    assert!(target.join("v").join("0.0.0").is_file());
    assert!(target.join("v").join("1.0.0").is_file());

    let cube = FileObj::new(target.to_str().unwrap(), None).unwrap();
    let state = zarr::read::read_state(&cube, "t").unwrap();
    assert_eq!(state.append_labels, vec![0.0, 1.0]);
    assert!(!dir.path().join("t.cube.lock").exists());
}

#[test]
fn test_missing_parent_directory_is_a_precondition_error() {
    let dir = tempfile::TempDir::new().unwrap();
    let target = dir.path().join("no/such/parent/t.cube");
    let config = Config::from_value(serde_json::json!({
        "target_dir": target.to_str().unwrap(),
        "append_dim": "t",
    }))
    .unwrap();
    let err = Processor::new(config).unwrap_err();
    assert!(matches!(err, Error::Config(_)));
    assert!(err.to_string().contains("parent directory"));
}
