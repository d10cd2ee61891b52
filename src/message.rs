//! User-facing (localized) messages returned alongside error details.
//!
//! The platform's users read Traditional Chinese; log details stay in English.

const JOB_LAUNCH: &str = "啟動課程失敗: ";
const JOB_DELETE: &str = "刪除課程失敗: ";
const CLASSROOM_CREATE: &str = "教室建立失敗: ";
const CLASSROOM_UPDATE: &str = "更新教室失敗: ";
const CLASSROOM_DELETE: &str = "刪除教室失敗: ";
const COURSE_DELETE: &str = "刪除課程失敗: ";

// --- Job launch ---

pub fn launch_quota(user: &str, active: u64) -> String {
  format!("{JOB_LAUNCH}同時間只能啟用1個課程，但您 {{{user}}} 已經啟動 {{{active}}} 個課程")
}

pub fn launch_owner(user: &str) -> String {
  format!("{JOB_LAUNCH}開課列表內課程只能由建立者啟動，但您 {{{user}}} 不是課程建立者")
}

pub fn launch_time(classroom_name: &str, window: &str) -> String {
  format!("{JOB_LAUNCH}教室 {{{classroom_name}}} 的課程只能在 {{{window}}} 啟動，現在不是允許的使用時間")
}

pub fn launch_member(user: &str, classroom_name: &str) -> String {
  format!("{JOB_LAUNCH}只有成員可以啟動教室內課程，但您 {{{user}}} 並不屬於教室 {{{classroom_name}}}")
}

pub fn launch_not_public(classroom_name: &str) -> String {
  format!("{JOB_LAUNCH}教室 {{{classroom_name}}} 尚未開放")
}

pub fn launch_not_in_classroom(course_id: &str, classroom_name: &str) -> String {
  format!("{JOB_LAUNCH}課程 {{{course_id}}} 不在教室 {{{classroom_name}}} 內")
}

pub fn launch_port(course_name: &str, owner: &str) -> String {
  format!("{JOB_LAUNCH}課程 {{{course_name}}} 沒有定義所需要端口，請洽 {{{owner}}} 修改設定")
}

pub fn launch_build(course: &str) -> String {
  format!("{JOB_LAUNCH}讀取課程 {{{course}}} 參數錯誤")
}

pub fn launch_run(course: &str) -> String {
  format!("{JOB_LAUNCH}啟動課程 {{{course}}} 後台資源系統出錯")
}

pub fn launch_empty_user() -> String {
  format!("{JOB_LAUNCH}使用者欄位不可為空")
}

pub fn job_delete(job_id: &str) -> String {
  format!("{JOB_DELETE}刪除運行中的課程 {{{job_id}}} 失敗")
}

pub fn stack_failure(detail: &str) -> String {
  format!("{JOB_LAUNCH}虛擬機課程系統回應錯誤: {detail}")
}

// --- Classroom create ---

pub fn classroom_create_info(name: &str) -> String {
  format!("{CLASSROOM_CREATE}新增教室 {{{name}}} 基本資訊失敗")
}

pub fn classroom_create_course(name: &str) -> String {
  format!("{CLASSROOM_CREATE}新增教室 {{{name}}} 課程資訊失敗")
}

pub fn classroom_create_schedule(name: &str) -> String {
  format!("{CLASSROOM_CREATE}新增教室 {{{name}}} 允許時用時間資訊失敗")
}

pub fn classroom_create_teacher(name: &str) -> String {
  format!("{CLASSROOM_CREATE}新增教室 {{{name}}} 老師資訊失敗")
}

pub fn classroom_create_student(name: &str) -> String {
  format!("{CLASSROOM_CREATE}新增教室 {{{name}}} 學生資訊失敗")
}

pub fn classroom_create_calendar(name: &str) -> String {
  format!("{CLASSROOM_CREATE}新增教室 {{{name}}} 日曆資訊失敗")
}

pub fn classroom_create_namespace(name: &str) -> String {
  format!("{CLASSROOM_CREATE}建立教室 {{{name}}} 命名空間失敗")
}

pub fn classroom_create_dataset(name: &str) -> String {
  format!("{CLASSROOM_CREATE}建立教室 {{{name}}} 資料集失敗")
}

pub fn classroom_create_secret(name: &str) -> String {
  format!("{CLASSROOM_CREATE}建立教室 {{{name}}} 憑證失敗")
}

pub fn classroom_create_role(name: &str) -> String {
  format!("{CLASSROOM_CREATE}建立教室 {{{name}}} 權限失敗")
}

pub fn classroom_create_schedule_invalid(expr: &str) -> String {
  format!("{CLASSROOM_CREATE}排程格式 {{{expr}}} 不合法")
}

pub fn classroom_create_name_missing() -> String {
  format!("{CLASSROOM_CREATE}教室名稱不可為空")
}

// --- Classroom update ---

pub fn classroom_update_info(name: &str) -> String {
  format!("{CLASSROOM_UPDATE}更新教室 {{{name}}} 基本資訊失敗")
}

pub fn classroom_update_student(name: &str) -> String {
  format!("{CLASSROOM_UPDATE}更新教室 {{{name}}} 學生資訊失敗")
}

pub fn classroom_update_teacher(name: &str) -> String {
  format!("{CLASSROOM_UPDATE}更新教室 {{{name}}} 老師資訊失敗")
}

pub fn classroom_update_schedule(name: &str) -> String {
  format!("{CLASSROOM_UPDATE}更新教室 {{{name}}} 允許使用時間資訊失敗")
}

pub fn classroom_update_course(name: &str) -> String {
  format!("{CLASSROOM_UPDATE}更新教室 {{{name}}} 課程資訊失敗")
}

pub fn classroom_update_calendar(name: &str) -> String {
  format!("{CLASSROOM_UPDATE}更新教室 {{{name}}} 日曆資訊失敗")
}

pub fn classroom_update_schedule_invalid(expr: &str) -> String {
  format!("{CLASSROOM_UPDATE}排程格式 {{{expr}}} 不合法")
}

pub fn classroom_update_resources(name: &str) -> String {
  format!("{CLASSROOM_UPDATE}同步教室 {{{name}}} 運行中課程排程失敗")
}

pub fn classroom_update_reserved(id: &str) -> String {
  format!("{CLASSROOM_UPDATE}系統不允許修改教室 {{{id}}}")
}

pub fn classroom_id_missing() -> String {
  format!("{CLASSROOM_UPDATE}教室編號不可為空")
}

// --- Classroom delete ---

pub fn classroom_delete_namespace(name: &str) -> String {
  format!("{CLASSROOM_DELETE}刪除教室 {{{name}}} 後台命名空間失敗")
}

pub fn classroom_delete_dataset(name: &str) -> String {
  format!("{CLASSROOM_DELETE}刪除教室 {{{name}}} 後台資料集失敗")
}

pub fn classroom_delete_reserved(id: &str) -> String {
  format!("{CLASSROOM_DELETE}系統不允許刪除教室 {{{id}}}")
}

pub fn classroom_delete_info(id: &str) -> String {
  format!("{CLASSROOM_DELETE}刪除教室 {{{id}}} 基本資訊失敗")
}

// --- Course delete ---

pub fn course_delete_info(name: &str) -> String {
  format!("{COURSE_DELETE}刪除課程 {{{name}}} 資本資訊失敗")
}

pub fn course_delete_job(name: &str) -> String {
  format!("{COURSE_DELETE}刪除運行中的課程 {{{name}}} 失敗")
}

// --- Generic ---

pub fn not_found(entity: &str, id: &str) -> String {
  format!("查無{entity} {{{id}}}")
}

pub fn storage_failure() -> String {
  "資料庫存取失敗，請稍後再試".to_string()
}
