use rust_xlsxwriter::{Color, Format, FormatBorder, Workbook, Worksheet};

use super::error::BulkResult;
use super::resolver::ReferenceData;
use super::schema::{DATE_FORMATS, GENDERS, GUARDIAN_RELATIONS, IMPORT_COLUMNS};

pub const TEMPLATE_FILE_NAME: &str = "student-import-template.xlsx";

pub const SHEET_STUDENTS: &str = "Students";
pub const SHEET_INSTRUCTIONS: &str = "Instructions";
pub const SHEET_CLASSES: &str = "Classes";
pub const SHEET_VALID_VALUES: &str = "Valid Values";

fn header_format() -> Format {
    Format::new()
        .set_bold()
        .set_background_color(Color::RGB(0xD9E1F2))
        .set_border(FormatBorder::Thin)
}

fn write_header(sheet: &mut Worksheet, labels: &[&str], format: &Format) -> BulkResult<()> {
    for (col, label) in labels.iter().enumerate() {
        sheet.write_string_with_format(0, col as u16, *label, format)?;
    }
    sheet.set_freeze_panes(1, 0)?;
    Ok(())
}

fn students_sheet(sheet: &mut Worksheet) -> BulkResult<()> {
    sheet.set_name(SHEET_STUDENTS)?;
    let optional = header_format();
    let required = header_format().set_font_color(Color::RGB(0xC00000));
    for (col, c) in IMPORT_COLUMNS.iter().enumerate() {
        let format = if c.required { &required } else { &optional };
        sheet.write_string_with_format(0, col as u16, c.header(), format)?;
        sheet.write_string(1, col as u16, c.sample)?;
    }
    sheet.set_freeze_panes(1, 0)?;
    sheet.autofit();
    Ok(())
}

fn instructions_sheet(sheet: &mut Worksheet) -> BulkResult<()> {
    sheet.set_name(SHEET_INSTRUCTIONS)?;
    let bold = Format::new().set_bold();
    let lines = [
        "Fill one student per row on the Students sheet, starting at row 2.",
        "Columns marked * are required. Keep the column order unchanged.",
        "Delete the sample row before uploading.",
        "Rows with an empty Admission Number are skipped.",
        "Class and Section must match the Classes sheet (case does not matter).",
        "See the Valid Values sheet for genders, guardian relations and date formats.",
        "At most 500 students can be imported per file.",
    ];
    sheet.write_string_with_format(0, 0, "Student import", &bold)?;
    for (i, line) in lines.iter().enumerate() {
        sheet.write_string((i + 2) as u32, 0, *line)?;
    }

    let start = (lines.len() + 3) as u32;
    let header = header_format();
    for (col, label) in ["Column", "Required", "Notes"].iter().enumerate() {
        sheet.write_string_with_format(start, col as u16, *label, &header)?;
    }
    for (i, c) in IMPORT_COLUMNS.iter().enumerate() {
        let row = start + 1 + i as u32;
        sheet.write_string(row, 0, c.label)?;
        sheet.write_string(row, 1, if c.required { "yes" } else { "no" })?;
        if !c.note.is_empty() {
            sheet.write_string(row, 2, c.note)?;
        }
    }
    sheet.set_column_width(0, 24)?;
    sheet.set_column_width(1, 10)?;
    sheet.set_column_width(2, 48)?;
    Ok(())
}

fn classes_sheet(sheet: &mut Worksheet, refs: &ReferenceData) -> BulkResult<()> {
    sheet.set_name(SHEET_CLASSES)?;
    write_header(sheet, &["Class", "Section"], &header_format())?;
    let mut row = 1u32;
    for class in refs.classes() {
        if class.sections.is_empty() {
            sheet.write_string(row, 0, &class.name)?;
            row += 1;
            continue;
        }
        for section in &class.sections {
            sheet.write_string(row, 0, &class.name)?;
            sheet.write_string(row, 1, section)?;
            row += 1;
        }
    }
    sheet.autofit();
    Ok(())
}

fn valid_values_sheet(sheet: &mut Worksheet) -> BulkResult<()> {
    sheet.set_name(SHEET_VALID_VALUES)?;
    write_header(sheet, &["Gender", "Guardian Relation", "Date Format"], &header_format())?;
    for (i, g) in GENDERS.iter().enumerate() {
        sheet.write_string((i + 1) as u32, 0, *g)?;
    }
    for (i, r) in GUARDIAN_RELATIONS.iter().enumerate() {
        sheet.write_string((i + 1) as u32, 1, *r)?;
    }
    for (i, (_, display)) in DATE_FORMATS.iter().enumerate() {
        sheet.write_string((i + 1) as u32, 2, *display)?;
    }
    sheet.autofit();
    Ok(())
}

pub fn render_template(refs: &ReferenceData) -> BulkResult<Vec<u8>> {
    let mut workbook = Workbook::new();
    students_sheet(workbook.add_worksheet())?;
    instructions_sheet(workbook.add_worksheet())?;
    classes_sheet(workbook.add_worksheet(), refs)?;
    valid_values_sheet(workbook.add_worksheet())?;
    Ok(workbook.save_to_buffer()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bulk::import::{read_rows, ImportFileType};
    use crate::db;
    use calamine::{open_workbook_auto_from_rs, Data, Reader};
    use rusqlite::Connection;
    use std::io::Cursor;

    fn refs() -> ReferenceData {
        let conn = Connection::open_in_memory().expect("open");
        db::init_schema(&conn).expect("schema");
        conn.execute_batch(
            "INSERT INTO classes(id, tenant_id, name, sort_order) VALUES('c1', 't1', 'Grade 1', 1);
             INSERT INTO classes(id, tenant_id, name, sort_order) VALUES('c2', 't1', 'Grade 2', 2);
             INSERT INTO sections(id, tenant_id, class_id, name) VALUES('s1', 't1', 'c1', 'A');
             INSERT INTO sections(id, tenant_id, class_id, name) VALUES('s2', 't1', 'c1', 'B');",
        )
        .expect("seed");
        ReferenceData::load(&conn, "t1").expect("refs")
    }

    fn text(cell: Option<&Data>) -> String {
        match cell {
            Some(Data::String(s)) => s.clone(),
            _ => String::new(),
        }
    }

    #[test]
    fn template_has_four_sheets_with_reference_data() {
        let bytes = render_template(&refs()).expect("render");
        let mut wb = open_workbook_auto_from_rs(Cursor::new(bytes)).expect("open");
        assert_eq!(
            wb.sheet_names(),
            vec![SHEET_STUDENTS, SHEET_INSTRUCTIONS, SHEET_CLASSES, SHEET_VALID_VALUES]
        );

        let students = wb.worksheet_range(SHEET_STUDENTS).expect("students");
        assert_eq!(text(students.get_value((0, 0))), "Admission Number *");
        assert_eq!(text(students.get_value((0, 7))), "Roll Number");
        assert_eq!(text(students.get_value((1, 0))), "ADM-2026-001");

        let classes = wb.worksheet_range(SHEET_CLASSES).expect("classes");
        let pairs: Vec<(String, String)> = classes
            .rows()
            .skip(1)
            .map(|r| (text(r.first()), text(r.get(1))))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("Grade 1".to_string(), "A".to_string()),
                ("Grade 1".to_string(), "B".to_string()),
                ("Grade 2".to_string(), String::new()),
            ]
        );
    }

    #[test]
    fn sample_row_parses_back_through_the_importer() {
        let bytes = render_template(&refs()).expect("render");
        let rows = read_rows(&bytes, ImportFileType::Xlsx).expect("rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].row_number, 2);
    }
}
