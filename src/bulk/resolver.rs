use rusqlite::Connection;
use std::collections::HashMap;

use super::error::BulkResult;

#[derive(Debug, Clone)]
pub struct ClassEntry {
    pub id: String,
    pub name: String,
    pub sections: Vec<String>,
}

// Keys are lower-cased `class` and `class|section`.
#[derive(Debug, Default)]
pub struct ReferenceData {
    class_ids: HashMap<String, String>,
    section_ids: HashMap<String, String>,
    classes: Vec<ClassEntry>,
}

fn norm(s: &str) -> String {
    s.trim().to_lowercase()
}

fn section_key(class_name: &str, section_name: &str) -> String {
    format!("{}|{}", norm(class_name), norm(section_name))
}

impl ReferenceData {
    pub fn load(conn: &Connection, tenant_id: &str) -> BulkResult<Self> {
        let mut data = Self::default();

        let mut class_stmt = conn.prepare(
            "SELECT id, name FROM classes WHERE tenant_id = ? ORDER BY sort_order, name",
        )?;
        let classes = class_stmt
            .query_map([tenant_id], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        let mut index_by_id = HashMap::new();
        for (id, name) in classes {
            data.class_ids.insert(norm(&name), id.clone());
            index_by_id.insert(id.clone(), data.classes.len());
            data.classes.push(ClassEntry {
                id,
                name,
                sections: Vec::new(),
            });
        }

        let mut section_stmt = conn.prepare(
            "SELECT s.id, s.class_id, s.name FROM sections s
             JOIN classes c ON c.id = s.class_id
             WHERE s.tenant_id = ? AND c.tenant_id = ?
             ORDER BY s.name",
        )?;
        let sections = section_stmt
            .query_map([tenant_id, tenant_id], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        for (id, class_id, name) in sections {
            let Some(&idx) = index_by_id.get(&class_id) else {
                continue;
            };
            let class = &mut data.classes[idx];
            data.section_ids.insert(section_key(&class.name, &name), id);
            class.sections.push(name);
        }

        Ok(data)
    }

    pub fn class_id(&self, class_name: &str) -> Option<&str> {
        self.class_ids.get(&norm(class_name)).map(String::as_str)
    }

    pub fn section_id(&self, class_name: &str, section_name: &str) -> Option<&str> {
        self.section_ids
            .get(&section_key(class_name, section_name))
            .map(String::as_str)
    }

    pub fn classes(&self) -> &[ClassEntry] {
        &self.classes
    }
}
