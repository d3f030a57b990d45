use serde_json::{Map, Value};

use super::ValidationError;

pub(super) const PRA_MARKERS: &[&str] = &["areaName", "PRABoxes", "PRAPolygons"];
pub(super) const SPAWNGEAR_MARKERS: &[&str] = &["attachmentSlotItemSets", "discreteUnsortedItemSets"];

// ================= pra =================

pub(super) fn check_pra(body: &Value) -> Result<(), ValidationError> {
    let obj = as_object(body, "Restricted area file")?;

    match obj.get("areaName") {
        Some(Value::String(_)) => {}
        _ => return Err(ValidationError::new("areaName must be a string")),
    }

    let boxes = obj
        .get("PRABoxes")
        .and_then(Value::as_array)
        .ok_or_else(|| ValidationError::new("PRABoxes must be an array"))?;
    for (i, b) in boxes.iter().enumerate() {
        check_box(b).map_err(|reason| {
            ValidationError::new(format!("PRABoxes[{i}] {reason}"))
        })?;
    }

    let mut polygon_count = 0;
    if let Some(polygons) = obj.get("PRAPolygons") {
        let polygons = polygons
            .as_array()
            .ok_or_else(|| ValidationError::new("PRAPolygons must be an array"))?;
        for (i, poly) in polygons.iter().enumerate() {
            let points = poly.as_array().filter(|p| p.len() >= 3).ok_or_else(|| {
                ValidationError::new(format!("PRAPolygons[{i}] needs at least 3 points"))
            })?;
            if !points.iter().all(|p| is_number_tuple(p, 2)) {
                return Err(ValidationError::new(format!(
                    "PRAPolygons[{i}] points must be [x, z] number pairs"
                )));
            }
        }
        polygon_count = polygons.len();
    }

    let safe_3d = obj
        .get("safePositions3D")
        .and_then(Value::as_array)
        .ok_or_else(|| ValidationError::new("safePositions3D must be an array"))?;
    if !safe_3d.iter().all(|p| is_number_tuple(p, 3)) {
        return Err(ValidationError::new(
            "safePositions3D entries must be [x, y, z] number triples",
        ));
    }

    if let Some(safe_2d) = obj.get("safePositions") {
        let ok = safe_2d
            .as_array()
            .is_some_and(|list| list.iter().all(|p| is_number_tuple(p, 2)));
        if !ok {
            return Err(ValidationError::new(
                "safePositions entries must be [x, z] number pairs",
            ));
        }
    }

    if boxes.is_empty() && polygon_count == 0 {
        return Err(ValidationError::new(
            "Restricted area file needs at least one box or polygon",
        ));
    }
    Ok(())
}

/// `[size, rotation, position]`, each a 3-number array.
fn check_box(value: &Value) -> Result<(), &'static str> {
    let parts = value
        .as_array()
        .filter(|parts| parts.len() == 3)
        .ok_or("must be [size, rotation, position]")?;
    if parts.iter().all(|p| is_number_tuple(p, 3)) {
        Ok(())
    } else {
        Err("components must be arrays of 3 numbers")
    }
}

// ================= spawngear =================

pub(super) fn check_spawngear(body: &Value) -> Result<(), ValidationError> {
    let obj = as_object(body, "Spawn gear file")?;
    let has_set = SPAWNGEAR_MARKERS
        .iter()
        .any(|k| obj.get(*k).is_some_and(Value::is_array));
    if has_set {
        Ok(())
    } else {
        Err(ValidationError::new(
            "Spawn gear file needs attachmentSlotItemSets or discreteUnsortedItemSets",
        ))
    }
}

// ================= spawner =================

pub(super) fn check_spawner(body: &Value) -> Result<(), ValidationError> {
    if is_spawner_shape(body) {
        Ok(())
    } else {
        Err(ValidationError::new(
            "Spawner file must be a non-empty object or a non-empty array of objects",
        ))
    }
}

pub(super) fn is_spawner_shape(body: &Value) -> bool {
    match body {
        Value::Object(map) => !map.is_empty(),
        Value::Array(items) => !items.is_empty() && items.iter().all(Value::is_object),
        _ => false,
    }
}

// ================= helpers =================

fn as_object<'a>(body: &'a Value, what: &str) -> Result<&'a Map<String, Value>, ValidationError> {
    body.as_object()
        .ok_or_else(|| ValidationError::new(format!("{what} must be a JSON object")))
}

fn is_number_tuple(value: &Value, len: usize) -> bool {
    value
        .as_array()
        .is_some_and(|a| a.len() == len && a.iter().all(Value::is_number))
}
