//! The append engine: creates or extends the cube inside a transaction.
//!
//! Both paths journal every mutation before performing it and end in
//! either a commit or a rollback to the exact pre-transaction state.

use crate::attrs::{self, EvalContext};
use crate::config::{AttrsUpdateMode, Config};
use crate::dataset::{Array, Attrs, Dataset};
use crate::error::{Error, Result};
use crate::fsutil::FileObj;
use crate::processor::CancelToken;
use crate::schema::{self, CubeSchema, CubeState, VariableSchema};
use crate::transaction::{Transaction, TxnKind};
use crate::zarr::meta::{zattrs_for_variable, ZArray, ZGroup};
use crate::zarr::write::{consolidated_metadata, encode_chunk};
use crate::zarr::{
    chunk_count, chunk_grid, chunk_grid_range, chunk_key, chunk_region, ZARRAY_FILE, ZATTRS_FILE,
    ZGROUP_FILE, ZMETADATA_FILE,
};

/// Run one slice through a transaction: create the cube if it does not
/// exist, extend it otherwise.
///
/// The lock is taken first; the create-or-append decision, the state
/// read and the slice validation all happen under it, so a concurrent
/// writer can never invalidate them.
pub fn process_dataset(
    config: &Config,
    target_dir: &FileObj,
    temp_dir: &FileObj,
    slice: &Dataset,
    cancel: &CancelToken,
) -> Result<()> {
    let lock = crate::lock::TargetLock::acquire(target_dir, config.polling(), cancel)?;
    if crate::zarr::read::is_cube(target_dir)? {
        let state = crate::zarr::read::read_state(target_dir, &config.append_dim)?;
        let txn = Transaction::begin_locked(
            TxnKind::Append,
            target_dir,
            temp_dir,
            lock,
            config.disable_rollback,
            Some(state.append_size as u64),
        )?;
        let result = schema::validate_slice(&state.schema, slice)
            .and_then(|_| check_step_constraint(config, slice, &state))
            .and_then(|_| write_append(config, target_dir, slice, &state, &txn, cancel));
        match result {
            Ok(()) => txn.commit(),
            Err(e) => Err(txn.rollback(e)),
        }
    } else {
        // Schema derivation is pure; a failure here releases the lock
        // without a transaction ever starting.
        let cube_schema = schema::derive_schema(config, slice)?;
        let txn = Transaction::begin_locked(
            TxnKind::Create,
            target_dir,
            temp_dir,
            lock,
            config.disable_rollback,
            None,
        )?;
        match write_new_cube(config, target_dir, slice, &cube_schema, &txn, cancel) {
            Ok(()) => txn.commit(),
            Err(e) => Err(txn.rollback(e)),
        }
    }
}

fn write_new_cube(
    config: &Config,
    target_dir: &FileObj,
    slice: &Dataset,
    cube_schema: &CubeSchema,
    txn: &Transaction,
    cancel: &CancelToken,
) -> Result<()> {
    tracing::info!("Creating cube {}", target_dir.uri());
    txn.journal_added(target_dir, true)?;

    let zgroup = target_dir.child(ZGROUP_FILE);
    txn.journal_added(&zgroup, false)?;
    zgroup.write_json(&ZGroup::default())?;

    for (name, var_schema) in &cube_schema.variables {
        cancel.check()?;
        let variable = &slice.variables[name];
        let var_dir = target_dir.child(name);

        let zarray = var_dir.child(ZARRAY_FILE);
        txn.journal_added(&zarray, false)?;
        zarray.write_json(&ZArray::for_variable(var_schema, variable.array.shape()))?;

        let zattrs = var_dir.child(ZATTRS_FILE);
        txn.journal_added(&zattrs, false)?;
        zattrs.write_json(&zattrs_for_variable(var_schema))?;

        let shape = variable.array.shape();
        for index in chunk_grid(shape, &var_schema.chunks) {
            let region = chunk_region(&index, shape, &var_schema.chunks);
            write_chunk(txn, &var_dir, var_schema, &variable.array.extract(&region)?, &index)?;
        }
    }

    let mut group_attrs = slice.attrs.clone();
    for (key, value) in &config.attrs {
        group_attrs.insert(key.clone(), value.clone());
    }
    let group_attrs = maybe_eval_attrs(config, cube_schema, slice, None, group_attrs)?;
    if !group_attrs.is_empty() {
        let zattrs = target_dir.child(ZATTRS_FILE);
        txn.journal_added(&zattrs, false)?;
        zattrs.write_json(&group_attrs)?;
    }

    let zmetadata = target_dir.child(ZMETADATA_FILE);
    txn.journal_added(&zmetadata, false)?;
    zmetadata.write_json(&consolidated_metadata(target_dir)?)?;
    Ok(())
}

fn check_step_constraint(config: &Config, slice: &Dataset, state: &CubeState) -> Result<()> {
    let Some(step) = &config.append_step else {
        return Ok(());
    };
    let Some(&last) = state.append_labels.last() else {
        return Ok(());
    };
    let Some(coord) = slice.variables.get(&state.schema.append_dim) else {
        return Ok(());
    };
    let labels = coord.array.to_f64_vec();
    let Some(&first) = labels.first() else {
        return Ok(());
    };
    let units = state
        .schema
        .variables
        .get(&state.schema.append_dim)
        .and_then(|v| v.units.as_deref());
    schema::check_append_step(step, units, last, first)
}

fn write_append(
    config: &Config,
    target_dir: &FileObj,
    slice: &Dataset,
    state: &CubeState,
    txn: &Transaction,
    cancel: &CancelToken,
) -> Result<()> {
    let cube_schema = &state.schema;
    let n = state.append_size;
    tracing::info!(
        "Appending slice to {} at position {}",
        target_dir.uri(),
        n
    );

    for (name, var_schema) in &cube_schema.variables {
        cancel.check()?;
        let Some(axis) = var_schema.append_axis(&cube_schema.append_dim) else {
            // Variables without the append dimension are written once at
            // creation and never touched again.
            continue;
        };
        let variable = &slice.variables[name];
        let var_dir = target_dir.child(name);

        let new_shape = extended_shape(cube_schema, var_schema, axis, n + cube_schema.append_chunk);
        append_chunks(txn, &var_dir, var_schema, &variable.array, axis, n, &new_shape)?;

        let zarray = var_dir.child(ZARRAY_FILE);
        txn.journal_replace(&zarray)?;
        zarray.write_json(&ZArray::for_variable(var_schema, &new_shape))?;
    }

    update_group_attrs(config, target_dir, slice, state, txn)?;

    let zmetadata = target_dir.child(ZMETADATA_FILE);
    if zmetadata.exists()? {
        txn.journal_replace(&zmetadata)?;
    } else {
        txn.journal_added(&zmetadata, false)?;
    }
    zmetadata.write_json(&consolidated_metadata(target_dir)?)?;
    Ok(())
}

/// The store-side shape of a variable at a given append-axis length.
fn extended_shape(
    cube_schema: &CubeSchema,
    var_schema: &VariableSchema,
    axis: usize,
    append_len: usize,
) -> Vec<usize> {
    var_schema
        .dims
        .iter()
        .enumerate()
        .map(|(i, dim)| {
            if i == axis {
                append_len
            } else {
                cube_schema.fixed_dims.get(dim).copied().unwrap_or(0)
            }
        })
        .collect()
}

/// Write the new chunks a slice contributes: exactly one chunk layer
/// along the append axis, starting at element `n`.
fn append_chunks(
    txn: &Transaction,
    var_dir: &FileObj,
    var_schema: &VariableSchema,
    slice_array: &Array,
    axis: usize,
    n: usize,
    new_shape: &[usize],
) -> Result<()> {
    let append_chunk = var_schema.chunks[axis];
    let start_chunk = n / append_chunk;
    let end_chunk = chunk_count(new_shape[axis], append_chunk);

    for index in chunk_grid_range(
        new_shape,
        &var_schema.chunks,
        Some(axis),
        Some(start_chunk..end_chunk),
    ) {
        let mut region = chunk_region(&index, new_shape, &var_schema.chunks);
        // Store coordinates to slice-local coordinates on the append axis
        region[axis] = (region[axis].start - n)..(region[axis].end - n);
        let values = slice_array.extract(&region)?;
        write_chunk(txn, var_dir, var_schema, &values, &index)?;
    }
    Ok(())
}

fn write_chunk(
    txn: &Transaction,
    var_dir: &FileObj,
    var_schema: &VariableSchema,
    values: &Array,
    index: &[usize],
) -> Result<()> {
    let Some(bytes) = encode_chunk(values, var_schema)? else {
        // All-fill chunks are not written (sparse store)
        return Ok(());
    };
    let file = var_dir.child(&chunk_key(index));
    txn.journal_added(&file, false)?;
    file.write(&bytes)
}

fn update_group_attrs(
    config: &Config,
    target_dir: &FileObj,
    slice: &Dataset,
    state: &CubeState,
    txn: &Transaction,
) -> Result<()> {
    let mode = config.attrs_update_mode;
    if mode == AttrsUpdateMode::Ignore {
        return Ok(());
    }
    if mode == AttrsUpdateMode::Keep && config.attrs.is_empty() {
        return Ok(());
    }

    let mut group_attrs = match mode {
        AttrsUpdateMode::Keep => state.attrs.clone(),
        // Replacement is whole-object: keys absent from the slice are
        // dropped
        AttrsUpdateMode::Replace => slice.attrs.clone(),
        AttrsUpdateMode::Update => {
            let mut merged = state.attrs.clone();
            for (key, value) in &slice.attrs {
                merged.insert(key.clone(), value.clone());
            }
            merged
        }
        AttrsUpdateMode::Ignore => unreachable!("handled above"),
    };
    for (key, value) in &config.attrs {
        group_attrs.insert(key.clone(), value.clone());
    }
    let group_attrs = maybe_eval_attrs(
        config,
        &state.schema,
        slice,
        Some(&state.append_labels),
        group_attrs,
    )?;

    let zattrs = target_dir.child(ZATTRS_FILE);
    if zattrs.exists()? {
        txn.journal_replace(&zattrs)?;
    } else {
        txn.journal_added(&zattrs, false)?;
    }
    zattrs.write_json(&group_attrs)
}

/// Evaluate `{{ … }}` expressions against the post-append coordinate
/// labels, when the configuration permits them.
fn maybe_eval_attrs(
    config: &Config,
    cube_schema: &CubeSchema,
    slice: &Dataset,
    prior_labels: Option<&[f64]>,
    group_attrs: Attrs,
) -> Result<Attrs> {
    if !attrs::has_expressions(&group_attrs) {
        return Ok(group_attrs);
    }
    if !config.permit_eval {
        return Err(Error::config(
            "attribute values contain {{ … }} expressions; set 'permit_eval' \
             to true to evaluate them",
        ));
    }
    let mut ctx = EvalContext::default();
    for (name, var_schema) in &cube_schema.variables {
        let is_coordinate = var_schema.dims.len() == 1 && &var_schema.dims[0] == name;
        if !is_coordinate {
            continue;
        }
        let Some(variable) = slice.variables.get(name) else {
            continue;
        };
        let slice_labels = variable.array.to_f64_vec();
        let labels = if name == &cube_schema.append_dim {
            match prior_labels {
                Some(prior) => prior.iter().copied().chain(slice_labels).collect(),
                None => slice_labels,
            }
        } else {
            slice_labels
        };
        ctx.coords.insert(name.clone(), labels);
    }
    attrs::eval_attrs(&group_attrs, &ctx)
}
