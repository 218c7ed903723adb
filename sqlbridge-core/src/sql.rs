//! Idempotent DDL for the server-side prerequisites
//!
//! Every statement is safe to run repeatedly (`IF NOT EXISTS`,
//! `CREATE OR REPLACE`, guarded `DO` blocks), which is what makes concurrent
//! bootstraps from several clients safe without locking.

/// The probe statement used for verification and reachability checks
pub const NOOP_SQL: &str = "SELECT 1";

/// `CREATE FUNCTION` for the single-argument SQL execution procedure
pub fn exec_sql_function(name: &str) -> String {
    format!(
        r#"CREATE OR REPLACE FUNCTION public.{name}(sql_text text)
RETURNS jsonb
LANGUAGE plpgsql
SECURITY DEFINER
SET search_path = public
AS $$
DECLARE
  result jsonb;
BEGIN
  EXECUTE sql_text;
  GET DIAGNOSTICS result = ROW_COUNT;
  RETURN jsonb_build_object('success', true, 'row_count', result);
EXCEPTION WHEN OTHERS THEN
  RAISE EXCEPTION '%', SQLERRM USING ERRCODE = SQLSTATE;
END;
$$;

GRANT EXECUTE ON FUNCTION public.{name}(text) TO service_role;
GRANT EXECUTE ON FUNCTION public.{name}(text) TO authenticated;"#
    )
}

/// The audit table, its indexes and row-level security policies
pub fn migration_logs_table(table: &str) -> String {
    format!(
        r#"CREATE TABLE IF NOT EXISTS public.{table} (
  id SERIAL PRIMARY KEY,
  operation_id TEXT NOT NULL,
  operation_type TEXT NOT NULL,
  sql_content TEXT,
  status TEXT NOT NULL,
  method_used TEXT,
  execution_time_ms INTEGER,
  details JSONB,
  created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS idx_{table}_operation_id ON public.{table} (operation_id);
CREATE INDEX IF NOT EXISTS idx_{table}_status ON public.{table} (status);
CREATE INDEX IF NOT EXISTS idx_{table}_created_at ON public.{table} (created_at);

ALTER TABLE public.{table} ENABLE ROW LEVEL SECURITY;

DO $$
BEGIN
  IF NOT EXISTS (
    SELECT 1 FROM pg_policies WHERE tablename = '{table}' AND policyname = '{table}_authenticated_all'
  ) THEN
    CREATE POLICY {table}_authenticated_all ON public.{table}
      FOR ALL TO authenticated USING (true) WITH CHECK (true);
  END IF;
  IF NOT EXISTS (
    SELECT 1 FROM pg_policies WHERE tablename = '{table}' AND policyname = '{table}_anon_read'
  ) THEN
    CREATE POLICY {table}_anon_read ON public.{table}
      FOR SELECT TO anon USING (true);
  END IF;
END $$;"#
    )
}

/// Aggregate status procedure reporting which prerequisites are installed
pub fn system_status_function(name: &str, exec_sql: &str, logs_table: &str) -> String {
    format!(
        r#"CREATE OR REPLACE FUNCTION public.{name}()
RETURNS jsonb
LANGUAGE plpgsql
SECURITY DEFINER
SET search_path = public
AS $$
BEGIN
  RETURN jsonb_build_object(
    'exec_sql_function', EXISTS (
      SELECT 1 FROM pg_proc p JOIN pg_namespace n ON n.oid = p.pronamespace
      WHERE n.nspname = 'public' AND p.proname = '{exec_sql}'
    ),
    'migration_logs_table', EXISTS (
      SELECT 1 FROM information_schema.tables
      WHERE table_schema = 'public' AND table_name = '{logs_table}'
    ),
    'status_function', true,
    'sql_edge_function', NULL
  );
END;
$$;

GRANT EXECUTE ON FUNCTION public.{name}() TO authenticated;"#
    )
}

/// The module integrations registry
pub fn module_integrations_table(table: &str) -> String {
    format!(
        r#"CREATE TABLE IF NOT EXISTS public.{table} (
  id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
  source_module TEXT NOT NULL,
  target_module TEXT NOT NULL,
  integration_type TEXT NOT NULL,
  is_active BOOLEAN NOT NULL DEFAULT true,
  created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
  updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
  UNIQUE (source_module, target_module, integration_type)
);

ALTER TABLE public.{table} ENABLE ROW LEVEL SECURITY;

DO $$
BEGIN
  IF NOT EXISTS (
    SELECT 1 FROM pg_policies WHERE tablename = '{table}' AND policyname = '{table}_authenticated_all'
  ) THEN
    CREATE POLICY {table}_authenticated_all ON public.{table}
      FOR ALL TO authenticated USING (true) WITH CHECK (true);
  END IF;
END $$;"#
    )
}

/// Adds the per-integration settings column
pub fn module_integration_settings(table: &str) -> String {
    format!(
        r#"DO $$
BEGIN
  IF NOT EXISTS (
    SELECT 1 FROM information_schema.columns
    WHERE table_schema = 'public' AND table_name = '{table}' AND column_name = 'settings'
  ) THEN
    ALTER TABLE public.{table} ADD COLUMN settings JSONB NOT NULL DEFAULT '{{}}'::jsonb;
  END IF;
END $$;"#
    )
}
